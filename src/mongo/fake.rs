//! In-process MongoDB double used by the driver tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::collection::{LockRecord, MongoStore};
use crate::error::{PhysicalError, Result};

struct LockDoc {
    record: LockRecord,
    checked_in: Instant,
}

pub(crate) struct FakeMongo {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    locks: Mutex<BTreeMap<String, LockDoc>>,
    primary: Mutex<Option<String>>,
    offline: AtomicBool,
}

impl FakeMongo {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            locks: Mutex::new(BTreeMap::new()),
            primary: Mutex::new(Some("mongo-0:27017".to_string())),
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_primary(&self, primary: &str) {
        *self.primary.lock() = Some(primary.to_string());
    }

    /// Fail every call with a connection error while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn lock_doc(&self, key: &str) -> Option<LockRecord> {
        self.locks.lock().get(key).map(|doc| doc.record.clone())
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PhysicalError::ConnectionError("mongo: no reachable servers".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MongoStore for FakeMongo {
    async fn upsert(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check()?;
        self.data.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn find(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.data.lock().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.data.lock().remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn acquire_lock(&self, key: &str, value: &str, identity: &str) -> Result<bool> {
        self.check()?;
        let mut locks = self.locks.lock();
        match locks.get_mut(key) {
            Some(doc) if doc.record.identity != identity => Ok(false),
            Some(doc) => {
                doc.record.value = value.to_string();
                doc.checked_in = Instant::now();
                Ok(true)
            }
            None => {
                locks.insert(
                    key.to_string(),
                    LockDoc {
                        record: LockRecord {
                            value: value.to_string(),
                            identity: identity.to_string(),
                        },
                        checked_in: Instant::now(),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn refresh_lock(&self, key: &str, identity: &str) -> Result<bool> {
        self.check()?;
        match self.locks.lock().get_mut(key) {
            Some(doc) if doc.record.identity == identity => {
                doc.checked_in = Instant::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &str, identity: &str) -> Result<bool> {
        self.check()?;
        let mut locks = self.locks.lock();
        if locks.get(key).map(|doc| doc.record.identity == identity) == Some(true) {
            locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn lock_holder(&self, key: &str) -> Result<Option<LockRecord>> {
        self.check()?;
        Ok(self.lock_doc(key))
    }

    async fn remove_stale_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let mut locks = self.locks.lock();
        if locks.get(key).map(|doc| doc.checked_in.elapsed() >= ttl) == Some(true) {
            locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn primary(&self) -> Result<Option<String>> {
        self.check()?;
        Ok(self.primary.lock().clone())
    }
}
