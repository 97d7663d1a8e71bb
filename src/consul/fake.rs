//! In-process Consul double used by the driver tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::api::{CheckStatus, ConsulApi, KvPair, KvTxnOp, KvVerb, ServiceRegistration};
use crate::error::{PhysicalError, Result};

#[derive(Default)]
struct State {
    kv: BTreeMap<String, KvPair>,
    sessions: HashSet<String>,
    next_session: u64,
    index: u64,
    services: HashMap<String, ServiceRegistration>,
    checks: HashMap<String, (CheckStatus, String)>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn set(&mut self, key: &str, value: &[u8], flags: u64, session: Option<String>) {
        let index = self.bump();
        self.kv.insert(
            key.to_string(),
            KvPair {
                key: key.to_string(),
                value: value.to_vec(),
                flags,
                session,
                modify_index: index,
            },
        );
    }
}

pub(crate) struct FakeConsul {
    state: Mutex<State>,
    changed: Notify,
    fail_acquire: AtomicBool,
    fail_destroy: AtomicBool,
}

impl FakeConsul {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            changed: Notify::new(),
            fail_acquire: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
        }
    }

    /// Make `kv_acquire` fail with a connection error.
    pub fn fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Make `session_destroy` fail with a connection error.
    pub fn fail_session_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub fn raw(&self, key: &str) -> Option<KvPair> {
        self.state.lock().kv.get(key).cloned()
    }

    pub fn service(&self, id: &str) -> Option<ServiceRegistration> {
        self.state.lock().services.get(id).cloned()
    }

    pub fn check(&self, id: &str) -> Option<(CheckStatus, String)> {
        self.state.lock().checks.get(id).cloned()
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let out = f(&mut self.state.lock());
        self.changed.notify_waiters();
        out
    }
}

#[async_trait]
impl ConsulApi for FakeConsul {
    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>> {
        Ok(self.raw(key))
    }

    async fn kv_watch(
        &self,
        key: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Option<KvPair>, u64)> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            {
                let state = self.state.lock();
                if state.index > index {
                    return Ok((state.kv.get(key).cloned(), state.index));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let state = self.state.lock();
                return Ok((state.kv.get(key).cloned(), state.index));
            }
        }
    }

    async fn kv_put(&self, key: &str, value: &[u8], flags: u64) -> Result<()> {
        self.mutate(|s| {
            let session = s.kv.get(key).and_then(|p| p.session.clone());
            s.set(key, value, flags, session)
        });
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<()> {
        self.mutate(|s| {
            if s.kv.remove(key).is_some() {
                s.bump();
            }
        });
        Ok(())
    }

    async fn kv_delete_cas(&self, key: &str, index: u64) -> Result<bool> {
        Ok(self.mutate(|s| match s.kv.get(key) {
            Some(pair) if pair.modify_index == index => {
                s.kv.remove(key);
                s.bump();
                true
            }
            _ => false,
        }))
    }

    async fn kv_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .kv
            .keys()
            .filter_map(|k| {
                let rest = k.strip_prefix(prefix)?;
                Some(match rest.find('/') {
                    Some(i) => format!("{prefix}{}", &rest[..=i]),
                    None => k.clone(),
                })
            })
            .collect();
        keys.dedup();
        Ok(keys)
    }

    async fn kv_acquire(&self, key: &str, value: &[u8], session: &str) -> Result<bool> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(PhysicalError::ConnectionError("acquire refused".into()));
        }
        self.mutate(|s| {
            if !s.sessions.contains(session) {
                return Err(PhysicalError::ConnectionError(format!(
                    "invalid session {session}"
                )));
            }
            match s.kv.get(key).and_then(|p| p.session.as_deref()) {
                Some(holder) if holder != session => Ok(false),
                _ => {
                    s.set(key, value, 0, Some(session.to_string()));
                    Ok(true)
                }
            }
        })
    }

    async fn kv_release(&self, key: &str, session: &str) -> Result<bool> {
        Ok(self.mutate(|s| {
            let held = s.kv.get(key).and_then(|p| p.session.as_deref()) == Some(session);
            if held {
                let index = s.bump();
                if let Some(pair) = s.kv.get_mut(key) {
                    pair.session = None;
                    pair.modify_index = index;
                }
            }
            held
        }))
    }

    async fn txn(&self, ops: &[KvTxnOp]) -> Result<()> {
        self.mutate(|s| {
            for op in ops {
                match op.verb {
                    KvVerb::Set => s.set(&op.key, &op.value, op.flags, None),
                    KvVerb::Delete => {
                        s.kv.remove(&op.key);
                        s.bump();
                    }
                }
            }
        });
        Ok(())
    }

    async fn session_create(&self, _name: &str, _ttl: Duration) -> Result<String> {
        Ok(self.mutate(|s| {
            s.next_session += 1;
            let id = format!("session-{}", s.next_session);
            s.sessions.insert(id.clone());
            id
        }))
    }

    async fn session_renew(&self, id: &str) -> Result<bool> {
        Ok(self.state.lock().sessions.contains(id))
    }

    async fn session_destroy(&self, id: &str) -> Result<()> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(PhysicalError::ConnectionError(format!(
                "destroy of session {id} refused"
            )));
        }
        self.mutate(|s| {
            s.sessions.remove(id);
            let index = s.bump();
            for pair in s.kv.values_mut() {
                if pair.session.as_deref() == Some(id) {
                    pair.session = None;
                    pair.modify_index = index;
                }
            }
        });
        Ok(())
    }

    async fn agent_self(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "Config": {"NodeName": "node-1"},
            "Member": {"Name": "node-1", "Addr": "10.0.0.5", "Port": 8301}
        }))
    }

    async fn service_register(&self, registration: &ServiceRegistration) -> Result<()> {
        self.mutate(|s| {
            s.services
                .insert(registration.id.clone(), registration.clone());
        });
        Ok(())
    }

    async fn service_deregister(&self, service_id: &str) -> Result<()> {
        self.mutate(|s| {
            s.services.remove(service_id);
            s.checks.retain(|id, _| !id.starts_with(service_id));
        });
        Ok(())
    }

    async fn check_update(&self, check_id: &str, status: CheckStatus, output: &str) -> Result<()> {
        self.mutate(|s| {
            s.checks
                .insert(check_id.to_string(), (status, output.to_string()));
        });
        Ok(())
    }
}
