//! In-process etcd double used by the driver tests.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::client::{EtcdKv, KeyValue, TxnOp};
use crate::error::{PhysicalError, Result};

#[derive(Default)]
struct State {
    kv: BTreeMap<String, KeyValue>,
    leases: HashSet<i64>,
    next_lease: i64,
    revision: i64,
}

impl State {
    fn put(&mut self, key: &str, value: &[u8], lease: i64) {
        self.revision += 1;
        let create_revision = self
            .kv
            .get(key)
            .map(|kv| kv.create_revision)
            .unwrap_or(self.revision);
        self.kv.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value: value.to_vec(),
                create_revision,
                mod_revision: self.revision,
                lease,
            },
        );
    }

    fn revoke(&mut self, lease: i64) {
        self.leases.remove(&lease);
        self.kv.retain(|_, kv| kv.lease != lease);
        self.revision += 1;
    }
}

pub(crate) struct FakeEtcd {
    state: Mutex<State>,
}

impl FakeEtcd {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn raw(&self, key: &str) -> Option<KeyValue> {
        self.state.lock().kv.get(key).cloned()
    }

    /// Drop every lease as if their TTLs ran out.
    pub fn expire_all_leases(&self) {
        let mut state = self.state.lock();
        let leases: Vec<i64> = state.leases.iter().copied().collect();
        for lease in leases {
            state.revoke(lease);
        }
    }
}

#[async_trait]
impl EtcdKv for FakeEtcd {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.raw(key))
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<i64>) -> Result<()> {
        self.state.lock().put(key, value, lease.unwrap_or(0));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state.lock().kv.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn txn(&self, ops: &[TxnOp]) -> Result<()> {
        let mut state = self.state.lock();
        for op in ops {
            match op {
                TxnOp::Put { key, value } => state.put(key, value, 0),
                TxnOp::Delete { key } => {
                    state.kv.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], lease: i64) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.leases.contains(&lease) {
            return Err(PhysicalError::Protocol(format!(
                "etcdserver: requested lease not found: {lease}"
            )));
        }
        if state.kv.contains_key(key) {
            return Ok(false);
        }
        state.put(key, value, lease);
        Ok(true)
    }

    async fn delete_if_lease(&self, key: &str, lease: i64) -> Result<bool> {
        let mut state = self.state.lock();
        match state.kv.get(key) {
            Some(kv) if kv.lease == lease => {
                state.kv.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lease_grant(&self, _ttl: Duration) -> Result<i64> {
        let mut state = self.state.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(id);
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: i64) -> Result<bool> {
        Ok(self.state.lock().leases.contains(&lease))
    }

    async fn lease_revoke(&self, lease: i64) -> Result<()> {
        self.state.lock().revoke(lease);
        Ok(())
    }
}
