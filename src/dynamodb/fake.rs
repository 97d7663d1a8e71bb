//! In-process DynamoDB table double used by the driver tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::table::{DynamoTable, Item, LockUpdate, WriteRequest};
use crate::error::Result;

pub(crate) struct FakeTable {
    rows: Mutex<BTreeMap<(String, String), Item>>,
    /// Requests reported back as unprocessed before the table accepts them.
    throttle: AtomicUsize,
}

impl FakeTable {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            throttle: AtomicUsize::new(0),
        }
    }

    pub fn raw(&self, path: &str, key: &str) -> Option<Item> {
        self.rows
            .lock()
            .get(&(path.to_string(), key.to_string()))
            .cloned()
    }

    pub fn insert(&self, item: Item) {
        self.rows
            .lock()
            .insert((item.path.clone(), item.key.clone()), item);
    }

    pub fn remove(&self, path: &str, key: &str) {
        self.rows.lock().remove(&(path.to_string(), key.to_string()));
    }

    /// Return the next `n` batch requests as unprocessed.
    pub fn throttle_next(&self, n: usize) {
        self.throttle.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }
}

#[async_trait]
impl DynamoTable for FakeTable {
    async fn get_item(&self, path: &str, key: &str) -> Result<Option<Item>> {
        Ok(self.raw(path, key))
    }

    async fn query(&self, path: &str, limit: Option<usize>) -> Result<Vec<Item>> {
        let rows = self.rows.lock();
        let matching = rows
            .iter()
            .filter(|((p, _), _)| p == path)
            .map(|(_, item)| item.clone());
        Ok(match limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<Vec<WriteRequest>> {
        let throttled = self.throttle.load(Ordering::SeqCst).min(requests.len());
        self.throttle.fetch_sub(throttled, Ordering::SeqCst);
        let split = requests.len() - throttled;

        let mut rows = self.rows.lock();
        for request in &requests[..split] {
            match request {
                WriteRequest::Put(item) => {
                    rows.insert((item.path.clone(), item.key.clone()), item.clone());
                }
                WriteRequest::Delete { path, key } => {
                    rows.remove(&(path.clone(), key.clone()));
                }
            }
        }
        Ok(requests[split..].to_vec())
    }

    async fn update_lock(&self, update: &LockUpdate) -> Result<bool> {
        let mut rows = self.rows.lock();
        let id = (update.path.clone(), update.key.clone());
        let allowed = match rows.get(&id) {
            None => update.create_if_missing,
            Some(existing) => {
                existing.identity.is_none()
                    || existing.identity.as_deref() == Some(update.identity.as_slice())
                    || existing.expires.map(|e| e <= update.now).unwrap_or(false)
            }
        };
        if !allowed {
            return Ok(false);
        }
        rows.insert(
            id,
            Item {
                path: update.path.clone(),
                key: update.key.clone(),
                value: update.value.clone(),
                identity: Some(update.identity.clone()),
                expires: Some(update.expires),
            },
        );
        Ok(true)
    }

    async fn delete_lock(&self, path: &str, key: &str, identity: &[u8]) -> Result<bool> {
        let mut rows = self.rows.lock();
        let id = (path.to_string(), key.to_string());
        match rows.get(&id) {
            Some(item) if item.identity.as_deref() == Some(identity) => {
                rows.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
