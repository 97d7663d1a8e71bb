//! Sub-tree view: every key is confined under a fixed prefix.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{PhysicalError, Result};
use crate::lock::Lock;
use crate::store::{
    Backend, Entry, HaBackend, Purgeable, RedirectDetect, ServiceDiscovery, Transactional,
    TxnEntry,
};

/// Decorator that prepends `prefix` to every key.
pub struct View {
    inner: Arc<dyn Backend>,
    prefix: String,
}

impl View {
    pub fn new(inner: Arc<dyn Backend>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Reject keys that could escape the view.
    fn sanity_check(key: &str) -> Result<()> {
        if key.split('/').any(|segment| segment == "..") {
            return Err(PhysicalError::InvalidKey(format!(
                "relative paths not supported: {key}"
            )));
        }
        if key.starts_with('/') {
            return Err(PhysicalError::InvalidKey(format!(
                "absolute paths not supported in a view: {key}"
            )));
        }
        Ok(())
    }

    fn expand_key(&self, key: &str) -> Result<String> {
        Self::sanity_check(key)?;
        Ok(format!("{}{}", self.prefix, key))
    }

    fn truncate_key(&self, mut entry: Entry) -> Entry {
        if let Some(rest) = entry.key.strip_prefix(&self.prefix) {
            entry.key = rest.to_string();
        }
        entry
    }
}

#[async_trait]
impl Backend for View {
    async fn put(&self, mut entry: Entry) -> Result<()> {
        entry.key = self.expand_key(&entry.key)?;
        self.inner.put(entry).await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let key = self.expand_key(key)?;
        Ok(self.inner.get(&key).await?.map(|e| self.truncate_key(e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = self.expand_key(key)?;
        self.inner.delete(&key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = self.expand_key(prefix)?;
        self.inner.list(&prefix).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        self.inner.as_transactional().map(|_| self as &dyn Transactional)
    }

    fn as_ha(&self) -> Option<&dyn HaBackend> {
        self.inner.as_ha().map(|_| self as &dyn HaBackend)
    }

    fn as_service_discovery(&self) -> Option<&dyn ServiceDiscovery> {
        self.inner.as_service_discovery()
    }

    fn as_redirect_detect(&self) -> Option<&dyn RedirectDetect> {
        self.inner.as_redirect_detect()
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        self.inner.as_purgeable()
    }
}

#[async_trait]
impl Transactional for View {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        let txn = self.inner.as_transactional().ok_or_else(|| {
            PhysicalError::Unsupported("inner backend does not support transactions".to_string())
        })?;
        let txns = txns
            .into_iter()
            .map(|mut t| {
                t.entry.key = self.expand_key(&t.entry.key)?;
                Ok(t)
            })
            .collect::<Result<Vec<_>>>()?;
        txn.transaction(txns).await
    }
}

impl HaBackend for View {
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>> {
        let key = self.expand_key(key)?;
        match self.inner.as_ha() {
            Some(ha) => ha.lock_with(&key, value),
            None => Err(PhysicalError::Unsupported("inner backend has no HA".to_string())),
        }
    }

    fn ha_enabled(&self) -> bool {
        self.inner.as_ha().is_some_and(|ha| ha.ha_enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::{InmemBackend, InmemHaBackend, TransactionalInmemBackend};
    use crate::testing::{exercise_backend, exercise_ha_backend, exercise_transactional_backend};

    #[tokio::test]
    async fn test_view_conformance() {
        let inner = Arc::new(InmemBackend::new());
        let view = View::new(inner.clone(), "sub/");
        inner.put(Entry::new("outside", b"x".to_vec())).await.unwrap();
        exercise_backend(&view).await;
        assert_eq!(inner.list("").await.unwrap(), vec!["outside"]);

        exercise_transactional_backend(&View::new(
            Arc::new(TransactionalInmemBackend::new()),
            "sub/",
        ))
        .await;
    }

    #[tokio::test]
    async fn test_keys_are_prefixed() {
        let inner = Arc::new(InmemBackend::new());
        let view = View::new(inner.clone(), "logical/1234/");
        view.put(Entry::new("a/b", b"v".to_vec())).await.unwrap();

        assert!(inner.get("logical/1234/a/b").await.unwrap().is_some());
        let entry = view.get("a/b").await.unwrap().unwrap();
        assert_eq!(entry.key, "a/b");
        assert_eq!(view.list("").await.unwrap(), vec!["a/"]);
        assert_eq!(view.list("a/").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let inner = Arc::new(InmemBackend::new());
        inner.put(Entry::new("secret", b"x".to_vec())).await.unwrap();
        let view = View::new(inner.clone(), "sub/");

        for key in ["../secret", "a/../../secret", "/secret", ".."] {
            assert_eq!(view.get(key).await.unwrap_err().kind(), ErrorKind::InvalidKey);
            assert_eq!(
                view.put(Entry::new(key, b"y".to_vec())).await.unwrap_err().kind(),
                ErrorKind::InvalidKey
            );
            assert_eq!(view.delete(key).await.unwrap_err().kind(), ErrorKind::InvalidKey);
        }
        assert_eq!(view.list("../").await.unwrap_err().kind(), ErrorKind::InvalidKey);
        assert_eq!(inner.get("secret").await.unwrap().unwrap().value, b"x");

        // Dots inside a segment are ordinary characters.
        view.put(Entry::new("a..b", b"ok".to_vec())).await.unwrap();
    }

    #[tokio::test]
    async fn test_ha_keys_prefixed() {
        let ha = InmemHaBackend::new();
        let peer = ha.peer();
        let a = View::new(Arc::new(ha), "sub/");
        let b = View::new(Arc::new(peer), "sub/");
        exercise_ha_backend(&a, &b).await;
    }
}
