//! Key encoding enforcement.
//!
//! Writes are refused when the key is not valid UTF-8 or contains a
//! non-printable character, before the inner backend sees them. Reads and
//! lists pass through so existing data stays reachable.

use std::sync::Arc;

use async_trait::async_trait;
use unicode_general_category::{get_general_category, GeneralCategory};

use crate::error::{PhysicalError, Result};
use crate::lock::Lock;
use crate::store::{
    Backend, Entry, HaBackend, Operation, Purgeable, RedirectDetect, ServiceDiscovery,
    Transactional, TxnEntry,
};

/// Validate a key that arrived as raw bytes, e.g. from a request path.
pub fn decode_key(raw: &[u8]) -> Result<&str> {
    let key = std::str::from_utf8(raw)
        .map_err(|_| PhysicalError::InvalidEncoding(String::from_utf8_lossy(raw).into_owned()))?;
    check_key(key)?;
    Ok(key)
}

/// Letters, marks, numbers, punctuation, symbols and the ASCII space.
fn is_printable(c: char) -> bool {
    use GeneralCategory::*;
    match get_general_category(c) {
        Control | Format | Surrogate | PrivateUse | Unassigned | LineSeparator
        | ParagraphSeparator => false,
        SpaceSeparator => c == ' ',
        _ => true,
    }
}

/// Reject keys with any non-printable character.
pub fn check_key(key: &str) -> Result<()> {
    if !key.chars().all(is_printable) {
        return Err(PhysicalError::NonPrintable(key.to_string()));
    }
    Ok(())
}

/// Decorator enforcing [`check_key`] on every write.
pub struct StorageEncoding {
    inner: Arc<dyn Backend>,
}

impl StorageEncoding {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Backend for StorageEncoding {
    async fn put(&self, entry: Entry) -> Result<()> {
        check_key(&entry.key)?;
        self.inner.put(entry).await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
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
impl Transactional for StorageEncoding {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        let txn = self.inner.as_transactional().ok_or_else(|| {
            PhysicalError::Unsupported("inner backend does not support transactions".to_string())
        })?;
        for t in &txns {
            if matches!(t.operation, Operation::Put | Operation::Delete) {
                check_key(t.key())?;
            }
        }
        txn.transaction(txns).await
    }
}

impl HaBackend for StorageEncoding {
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>> {
        match self.inner.as_ha() {
            Some(ha) => ha.lock_with(key, value),
            None => Err(PhysicalError::Unsupported("inner backend has no HA".to_string())),
        }
    }

    fn ha_enabled(&self) -> bool {
        self.inner.as_ha().is_some_and(|ha| ha.ha_enabled())
    }
}
