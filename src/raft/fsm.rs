//! The replicated state machine: a KV map and an HA lock map.
//!
//! `apply` mutates under the map locks and returns the events it produced;
//! callers deliver them with [`Fsm::notify`] after the locks are released.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::command::{Command, TxnCommand};
use super::observer::{FsmEvent, HaEventType, KvEventType, Observers, Subscription};

/// A held HA lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaRecord {
    pub holder: String,
    pub ttl_ns: i64,
    pub acquired_ns: i64,
}

impl HaRecord {
    fn expired(&self, time_ns: i64) -> bool {
        time_ns >= self.acquired_ns.saturating_add(self.ttl_ns)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
struct SnapshotValue(#[serde(with = "crate::util::base64_bytes")] Vec<u8>);

/// Serialized FSM state: `{"ha_store": {...}, "kv_store": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmSnapshot {
    ha_store: BTreeMap<String, HaRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kv_store: Option<BTreeMap<String, SnapshotValue>>,
}

/// The state machine. One lock per map.
#[derive(Default)]
pub struct Fsm {
    kv: RwLock<BTreeMap<String, Vec<u8>>>,
    ha: RwLock<BTreeMap<String, HaRecord>>,
    observers: Observers,
}

impl Fsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        self.observers.subscribe()
    }

    /// Apply one committed command.
    pub fn apply(&self, command: &Command) -> Vec<FsmEvent> {
        match command {
            Command::KvSet { key, value } => {
                self.kv.write().insert(key.clone(), value.clone());
                vec![FsmEvent::kv(KvEventType::Set, key.clone(), value.clone())]
            }
            Command::KvDelete { key } => self.kv.write().remove(key).map_or_else(Vec::new, |old| {
                vec![FsmEvent::kv(KvEventType::Delete, key.clone(), old)]
            }),
            Command::KvTxn { ops } => {
                let mut kv = self.kv.write();
                let mut events = Vec::with_capacity(ops.len());
                for op in ops {
                    match op {
                        TxnCommand::Set { key, value } => {
                            kv.insert(key.clone(), value.clone());
                            events.push(FsmEvent::kv(KvEventType::Set, key.clone(), value.clone()));
                        }
                        TxnCommand::Delete { key } => {
                            if let Some(old) = kv.remove(key) {
                                events.push(FsmEvent::kv(KvEventType::Delete, key.clone(), old));
                            }
                        }
                    }
                }
                events
            }
            Command::TryLock {
                key,
                holder,
                ttl_ns,
                time_ns,
            } => {
                let mut ha = self.ha.write();
                match ha.get(key) {
                    Some(record) if record.holder != *holder => {
                        vec![FsmEvent::ha(HaEventType::TryFailed, key.clone(), holder.clone())]
                    }
                    _ => {
                        ha.insert(
                            key.clone(),
                            HaRecord {
                                holder: holder.clone(),
                                ttl_ns: *ttl_ns,
                                acquired_ns: *time_ns,
                            },
                        );
                        vec![FsmEvent::ha(HaEventType::Set, key.clone(), holder.clone())]
                    }
                }
            }
            Command::ReleaseLock { key, holder } => {
                let mut ha = self.ha.write();
                match ha.get(key) {
                    Some(record) if record.holder == *holder => {
                        ha.remove(key);
                        vec![FsmEvent::ha(HaEventType::Released, key.clone(), holder.clone())]
                    }
                    _ => vec![FsmEvent::ha(HaEventType::ReleaseFailed, key.clone(), holder.clone())],
                }
            }
            Command::ReleaseStale { time_ns } => {
                let mut ha = self.ha.write();
                let stale: Vec<String> = ha
                    .iter()
                    .filter(|(_, record)| record.expired(*time_ns))
                    .map(|(key, _)| key.clone())
                    .collect();
                stale
                    .into_iter()
                    .filter_map(|key| {
                        let record = ha.remove(&key)?;
                        Some(FsmEvent::ha(HaEventType::Released, key, record.holder))
                    })
                    .collect()
            }
            Command::RefreshLock {
                key,
                holder,
                time_ns,
            } => {
                if let Some(record) = self.ha.write().get_mut(key) {
                    if record.holder == *holder {
                        record.acquired_ns = *time_ns;
                    }
                }
                Vec::new()
            }
        }
    }

    pub async fn notify(&self, events: &[FsmEvent]) {
        self.observers.notify(events).await
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.kv.read().get(key).cloned()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.kv
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn lock_holder(&self, key: &str) -> Option<String> {
        self.ha.read().get(key).map(|r| r.holder.clone())
    }

    /// Whether any lock would be freed by a sweep at `time_ns`.
    pub fn has_stale_locks(&self, time_ns: i64) -> bool {
        self.ha.read().values().any(|r| r.expired(time_ns))
    }

    pub fn snapshot(&self) -> FsmSnapshot {
        let kv = self.kv.read();
        FsmSnapshot {
            ha_store: self.ha.read().clone(),
            kv_store: Some(
                kv.iter()
                    .map(|(k, v)| (k.clone(), SnapshotValue(v.clone())))
                    .collect(),
            ),
        }
    }

    /// Replace state with `snapshot`. A snapshot without `kv_store` leaves
    /// the KV map alone.
    pub fn restore(&self, snapshot: FsmSnapshot) {
        *self.ha.write() = snapshot.ha_store;
        if let Some(kv_store) = snapshot.kv_store {
            *self.kv.write() = kv_store.into_iter().map(|(k, v)| (k, v.0)).collect();
        }
    }
}
