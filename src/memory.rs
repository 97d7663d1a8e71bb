//! In-memory backend implementations.
//!
//! - [`InmemBackend`]: ordered map, for testing and as the reference for
//!   list ordering
//! - [`TransactionalInmemBackend`]: single-writer flavour using the generic
//!   transaction handler
//! - [`InmemHaBackend`]: adds an in-process leader lock table
//!
//! These implementations are NOT durable - data is lost on process exit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PhysicalError, Result};
use crate::lock::{LeaderLost, Lock};
use crate::permit::PermitPool;
use crate::store::{validate_key, Backend, Entry, HaBackend, Transactional, TxnEntry};
use crate::telemetry::measure;
use crate::transaction::{generic_transaction_handler, PseudoTransactional};
use crate::util::list_segments;

/// In-memory implementation of Backend.
///
/// Uses a BTreeMap for ordered key iteration and RwLock for concurrency.
pub struct InmemBackend {
    root: Arc<RwLock<BTreeMap<String, Entry>>>,
    permit_pool: PermitPool,
    max_value_size: Option<usize>,
    closed: AtomicBool,
}

impl InmemBackend {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::with_permits(0)
    }

    pub(crate) fn with_permits(permits: usize) -> Self {
        Self {
            root: Arc::new(RwLock::new(BTreeMap::new())),
            permit_pool: PermitPool::new(permits),
            max_value_size: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Reject values larger than `limit` bytes with `TooLarge`.
    pub fn with_max_value_size(mut self, limit: usize) -> Self {
        self.max_value_size = Some(limit);
        self
    }

    /// Get the number of entries in the store.
    pub fn len(&self) -> usize {
        self.root.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.root.read().is_empty()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.root.write().clear();
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PhysicalError::Closed);
        }
        Ok(())
    }
}

impl Default for InmemBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PseudoTransactional for InmemBackend {
    async fn get_internal(&self, key: &str) -> Result<Option<Entry>> {
        validate_key(key)?;
        Ok(self.root.read().get(key).cloned())
    }

    async fn put_internal(&self, entry: Entry) -> Result<()> {
        validate_key(&entry.key)?;
        if let Some(limit) = self.max_value_size {
            if entry.value.len() > limit {
                return Err(PhysicalError::too_large(&entry.key, entry.value.len(), limit));
            }
        }
        self.root.write().insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete_internal(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.root.write().remove(key);
        Ok(())
    }
}

#[async_trait]
impl Backend for InmemBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure("inmem", "put");
        self.check_open()?;
        let _permit = self.permit_pool.acquire().await?;
        self.put_internal(entry).await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _timer = measure("inmem", "get");
        self.check_open()?;
        let _permit = self.permit_pool.acquire().await?;
        self.get_internal(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure("inmem", "delete");
        self.check_open()?;
        let _permit = self.permit_pool.acquire().await?;
        self.delete_internal(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure("inmem", "list");
        self.check_open()?;
        let _permit = self.permit_pool.acquire().await?;
        let root = self.root.read();
        let keys = root
            .range(prefix.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix));
        Ok(list_segments(keys, prefix))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.permit_pool.close();
        Ok(())
    }
}

/// In-memory backend with generic transactions.
///
/// The permit pool has a single slot, so a transaction holding it sees no
/// interleaved writes.
pub struct TransactionalInmemBackend {
    inner: InmemBackend,
}

impl TransactionalInmemBackend {
    pub fn new() -> Self {
        Self {
            inner: InmemBackend::with_permits(1),
        }
    }

    pub fn inner(&self) -> &InmemBackend {
        &self.inner
    }
}

impl Default for TransactionalInmemBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PseudoTransactional for TransactionalInmemBackend {
    async fn get_internal(&self, key: &str) -> Result<Option<Entry>> {
        self.inner.get_internal(key).await
    }

    async fn put_internal(&self, entry: Entry) -> Result<()> {
        self.inner.put_internal(entry).await
    }

    async fn delete_internal(&self, key: &str) -> Result<()> {
        self.inner.delete_internal(key).await
    }
}

#[async_trait]
impl Backend for TransactionalInmemBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        self.inner.put(entry).await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

#[async_trait]
impl Transactional for TransactionalInmemBackend {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        let _timer = measure("inmem", "transaction");
        self.inner.check_open()?;
        let _permit = self.inner.permit_pool.acquire().await?;
        generic_transaction_handler(self, txns).await
    }
}

/// Holder record in the in-process lock table.
#[derive(Debug, Clone)]
struct LockOwner {
    handle: Uuid,
    value: String,
    lost: CancellationToken,
}

#[derive(Default)]
struct LockTable {
    locks: Mutex<HashMap<String, LockOwner>>,
    released: Notify,
}

/// In-memory backend with an in-process HA lock table.
pub struct InmemHaBackend {
    inner: InmemBackend,
    table: Arc<LockTable>,
}

impl InmemHaBackend {
    pub fn new() -> Self {
        Self {
            inner: InmemBackend::new(),
            table: Arc::new(LockTable::default()),
        }
    }

    /// A second backend sharing this one's lock table but with its own data,
    /// standing in for another node contending for the same locks.
    pub fn peer(&self) -> Self {
        Self {
            inner: InmemBackend::new(),
            table: self.table.clone(),
        }
    }
}

impl Default for InmemHaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InmemHaBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        self.inner.put(entry).await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn as_ha(&self) -> Option<&dyn HaBackend> {
        Some(self)
    }
}

impl HaBackend for InmemHaBackend {
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>> {
        Ok(Box::new(InmemLock {
            table: self.table.clone(),
            key: key.to_string(),
            value: value.to_string(),
            handle: Uuid::new_v4(),
        }))
    }

    fn ha_enabled(&self) -> bool {
        true
    }
}

/// Lock handle over the in-process lock table.
pub struct InmemLock {
    table: Arc<LockTable>,
    key: String,
    value: String,
    handle: Uuid,
}

impl InmemLock {
    fn try_acquire(&self) -> Result<Option<LeaderLost>> {
        let mut locks = self.table.locks.lock();
        match locks.get(&self.key) {
            Some(owner) if owner.handle == self.handle => Err(PhysicalError::LockConflict {
                key: self.key.clone(),
                holder: "lock already held by this handle".to_string(),
            }),
            Some(_) => Ok(None),
            None => {
                let lost = CancellationToken::new();
                locks.insert(
                    self.key.clone(),
                    LockOwner {
                        handle: self.handle,
                        value: self.value.clone(),
                        lost: lost.clone(),
                    },
                );
                Ok(Some(LeaderLost::new(lost)))
            }
        }
    }
}

#[async_trait]
impl Lock for InmemLock {
    async fn lock(&self, stop: CancellationToken) -> Result<Option<LeaderLost>> {
        if stop.is_cancelled() {
            return Ok(None);
        }
        loop {
            let released = self.table.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(lost) = self.try_acquire()? {
                debug!(key = %self.key, holder = %self.value, "acquired in-memory lock");
                return Ok(Some(lost));
            }

            tokio::select! {
                _ = stop.cancelled() => return Ok(None),
                _ = &mut released => {}
            }
        }
    }

    async fn unlock(&self) -> Result<()> {
        let owner = {
            let mut locks = self.table.locks.lock();
            match locks.get(&self.key) {
                Some(owner) if owner.handle == self.handle => locks.remove(&self.key),
                _ => None,
            }
        };
        if let Some(owner) = owner {
            owner.lost.cancel();
            self.table.released.notify_waiters();
        }
        Ok(())
    }

    async fn value(&self) -> Result<(bool, String)> {
        Ok(match self.table.locks.lock().get(&self.key) {
            Some(owner) => (true, owner.value.clone()),
            None => (false, String::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BackendExt;
    use crate::testing::{
        exercise_backend, exercise_backend_list_prefix, exercise_ha_backend,
        exercise_transactional_backend,
    };

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InmemBackend::new();

        store.put(Entry::new("test/key", b"value".to_vec())).await.unwrap();

        let entry = store.get("test/key").await.unwrap().unwrap();
        assert_eq!(entry.key, "test/key");
        assert_eq!(entry.value, b"value");
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let store = InmemBackend::new();
        assert!(store.get("nonexistent").await.unwrap().is_none());
        assert!(store.get_required("nonexistent").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_nonexistent() {
        let store = InmemBackend::new();
        // Should not error
        store.delete("nonexistent").await.unwrap();
        store.delete("nonexistent").await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_key() {
        let store = InmemBackend::new();
        let result = store.put(Entry::new("/leading-slash", b"v".to_vec())).await;
        assert!(matches!(result, Err(PhysicalError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_max_value_size() {
        let store = InmemBackend::new().with_max_value_size(4);
        let err = store.put(Entry::new("k", b"12345".to_vec())).await.unwrap_err();
        assert!(matches!(err, PhysicalError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn test_closed() {
        let store = InmemBackend::new();
        store.close().await.unwrap();
        assert!(matches!(store.get("k").await, Err(PhysicalError::Closed)));
    }

    #[tokio::test]
    async fn test_inmem_conformance() {
        let store = InmemBackend::new();
        exercise_backend(&store).await;
        exercise_backend_list_prefix(&store).await;
    }

    #[tokio::test]
    async fn test_transactional_conformance() {
        let store = TransactionalInmemBackend::new();
        exercise_backend(&store).await;
        exercise_transactional_backend(&store).await;
        assert!(store.capabilities().transactional);
        assert!(!InmemBackend::new().capabilities().transactional);
    }

    #[tokio::test]
    async fn test_ha_conformance() {
        let a = InmemHaBackend::new();
        let b = a.peer();
        exercise_ha_backend(&a, &b).await;
    }
}
