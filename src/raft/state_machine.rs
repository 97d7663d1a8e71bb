//! openraft state machine over [`Fsm`].
//!
//! Entries are applied under the applied-state lock so a snapshot always
//! pairs FSM contents with the log id they reflect. Events go to a
//! dispatcher task, so a slow subscriber never holds up apply.
//!
//! With a data directory, snapshots are written as
//! `snapshot-<index>.json` holding `{"meta": ..., "state": {"ha_store":
//! ..., "kv_store": ...}}`; the newest is loaded on open and only the
//! configured number are retained.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{EntryPayload, OptionalSend, StorageIOError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::fsm::{Fsm, FsmSnapshot};
use super::observer::FsmEvent;
use super::types::{Applied, Entry, LogId, SnapshotMeta, StorageError, StoredMembership, TypeConfig};
use crate::error::Result;

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Default)]
struct AppliedState {
    last_applied: Option<LogId>,
    membership: StoredMembership,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotFile {
    meta: SnapshotMeta,
    state: FsmSnapshot,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta,
    data: Vec<u8>,
}

impl StoredSnapshot {
    fn to_snapshot(&self) -> Snapshot<TypeConfig> {
        Snapshot {
            meta: self.meta.clone(),
            snapshot: Box::new(Cursor::new(self.data.clone())),
        }
    }
}

fn snapshot_index(name: &str) -> Option<u64> {
    name.strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(SNAPSHOT_SUFFIX)?
        .parse()
        .ok()
}

fn snapshot_name(index: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{index:020}{SNAPSHOT_SUFFIX}")
}

async fn snapshot_indexes(dir: &Path) -> Result<Vec<u64>> {
    let mut indexes = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(index) = entry.file_name().to_str().and_then(snapshot_index) {
            indexes.push(index);
        }
    }
    indexes.sort_unstable();
    Ok(indexes)
}

struct SnapshotDir {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotDir {
    async fn load_latest(&self) -> Result<Option<SnapshotFile>> {
        let Some(&index) = snapshot_indexes(&self.dir).await?.last() else {
            return Ok(None);
        };
        let raw = fs::read(self.dir.join(snapshot_name(index))).await?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn write(&self, file: &SnapshotFile) -> Result<()> {
        let index = file.meta.last_log_id.map(|id| id.index).unwrap_or(0);
        let name = snapshot_name(index);
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, serde_json::to_vec(file)?).await?;
        fs::rename(&tmp, self.dir.join(&name)).await?;

        let indexes = snapshot_indexes(&self.dir).await?;
        let excess = indexes.len().saturating_sub(self.retain);
        for old in &indexes[..excess] {
            fs::remove_file(self.dir.join(snapshot_name(*old))).await?;
        }
        debug!(index, pruned = excess, "wrote raft snapshot");
        Ok(())
    }
}

struct Inner {
    fsm: Arc<Fsm>,
    applied: RwLock<AppliedState>,
    current: Mutex<Option<StoredSnapshot>>,
    snapshots: Option<SnapshotDir>,
    events: mpsc::UnboundedSender<Vec<FsmEvent>>,
    built: AtomicU64,
}

/// The state machine handed to openraft; clones share one FSM.
#[derive(Clone)]
pub struct StateMachineStore {
    inner: Arc<Inner>,
}

fn sm_read_error(e: &crate::error::PhysicalError) -> StorageError {
    StorageIOError::read_state_machine(e).into()
}

fn snapshot_write_error(meta: &SnapshotMeta, e: &crate::error::PhysicalError) -> StorageError {
    StorageIOError::write_snapshot(Some(meta.signature()), e).into()
}

impl StateMachineStore {
    /// Build the store over `fsm`, restoring the newest snapshot found in
    /// `data_dir`.
    pub async fn open(fsm: Arc<Fsm>, data_dir: Option<&Path>, retain: usize) -> Result<Self> {
        let snapshots = match data_dir {
            Some(dir) => {
                fs::create_dir_all(dir).await?;
                Some(SnapshotDir {
                    dir: dir.to_path_buf(),
                    retain: retain.max(1),
                })
            }
            None => None,
        };

        let mut applied = AppliedState::default();
        let mut current = None;
        if let Some(dir) = &snapshots {
            if let Some(file) = dir.load_latest().await? {
                info!(last_log = ?file.meta.last_log_id, "Restoring raft snapshot");
                applied = AppliedState {
                    last_applied: file.meta.last_log_id,
                    membership: file.meta.last_membership.clone(),
                };
                current = Some(StoredSnapshot {
                    meta: file.meta,
                    data: serde_json::to_vec(&file.state)?,
                });
                fsm.restore(file.state);
            }
        }

        let (events, mut rx) = mpsc::unbounded_channel::<Vec<FsmEvent>>();
        let dispatch = fsm.clone();
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                dispatch.notify(&batch).await;
            }
        });

        Ok(Self {
            inner: Arc::new(Inner {
                fsm,
                applied: RwLock::new(applied),
                current: Mutex::new(current),
                snapshots,
                events,
                built: AtomicU64::new(0),
            }),
        })
    }

    pub fn last_applied(&self) -> Option<LogId> {
        self.inner.applied.read().last_applied
    }

    fn apply_entries(&self, entries: impl IntoIterator<Item = Entry>) -> Vec<Applied> {
        let mut responses = Vec::new();
        let mut events = Vec::new();
        {
            let mut applied = self.inner.applied.write();
            for entry in entries {
                applied.last_applied = Some(entry.log_id);
                let produced = match entry.payload {
                    EntryPayload::Blank => Vec::new(),
                    EntryPayload::Normal(ref command) => self.inner.fsm.apply(command),
                    EntryPayload::Membership(ref membership) => {
                        applied.membership =
                            StoredMembership::new(Some(entry.log_id), membership.clone());
                        Vec::new()
                    }
                };
                responses.push(Applied {
                    index: entry.log_id.index,
                    events: produced.len(),
                });
                events.extend(produced);
            }
        }
        if !events.is_empty() && self.inner.events.send(events).is_err() {
            debug!("raft event dispatcher stopped");
        }
        responses
    }

    async fn build(&self) -> Result<StoredSnapshot> {
        let (applied, state) = {
            let applied = self.inner.applied.read();
            (applied.clone(), self.inner.fsm.snapshot())
        };
        let built = self.inner.built.fetch_add(1, Ordering::Relaxed) + 1;
        let index = applied.last_applied.map(|id| id.index).unwrap_or(0);
        let meta = SnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.membership,
            snapshot_id: format!("{index}-{built}"),
        };
        let data = serde_json::to_vec(&state)?;
        if let Some(dir) = &self.inner.snapshots {
            dir.write(&SnapshotFile {
                meta: meta.clone(),
                state,
            })
            .await?;
        }
        let stored = StoredSnapshot { meta, data };
        *self.inner.current.lock().await = Some(stored.clone());
        Ok(stored)
    }

    async fn install(&self, meta: &SnapshotMeta, data: Vec<u8>) -> Result<()> {
        let state: FsmSnapshot = serde_json::from_slice(&data)?;
        if let Some(dir) = &self.inner.snapshots {
            dir.write(&SnapshotFile {
                meta: meta.clone(),
                state: state.clone(),
            })
            .await?;
        }
        {
            let mut applied = self.inner.applied.write();
            self.inner.fsm.restore(state);
            *applied = AppliedState {
                last_applied: meta.last_log_id,
                membership: meta.last_membership.clone(),
            };
        }
        info!(last_log = ?meta.last_log_id, "Installed raft snapshot");
        *self.inner.current.lock().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachineStore {
    async fn build_snapshot(&mut self) -> std::result::Result<Snapshot<TypeConfig>, StorageError> {
        let stored = self.build().await.map_err(|e| sm_read_error(&e))?;
        Ok(stored.to_snapshot())
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineStore {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> std::result::Result<(Option<LogId>, StoredMembership), StorageError> {
        let applied = self.inner.applied.read();
        Ok((applied.last_applied, applied.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> std::result::Result<Vec<Applied>, StorageError>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        Ok(self.apply_entries(entries))
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<Cursor<Vec<u8>>>, StorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> std::result::Result<(), StorageError> {
        self.install(meta, snapshot.into_inner())
            .await
            .map_err(|e| snapshot_write_error(meta, &e))
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<Snapshot<TypeConfig>>, StorageError> {
        Ok(self
            .inner
            .current
            .lock()
            .await
            .as_ref()
            .map(StoredSnapshot::to_snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::command::Command;
    use crate::raft::observer::{HaEventType, KvEventType};
    use openraft::{BasicNode, CommittedLeaderId, Membership};
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    fn log_id(index: u64) -> LogId {
        LogId::new(CommittedLeaderId::new(1, 1), index)
    }

    fn normal(index: u64, command: Command) -> Entry {
        Entry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(command),
        }
    }

    fn set(index: u64, key: &str) -> Entry {
        normal(
            index,
            Command::KvSet {
                key: key.into(),
                value: key.as_bytes().to_vec(),
            },
        )
    }

    #[tokio::test]
    async fn test_apply_tracks_state_and_dispatches_events() {
        let fsm = Arc::new(Fsm::new());
        let mut events = fsm.subscribe();
        let mut sm = StateMachineStore::open(fsm.clone(), None, 2).await.unwrap();

        let membership = Membership::new(
            vec![BTreeSet::from([1u64])],
            BTreeMap::from([(1u64, BasicNode::new("127.0.0.1:8201"))]),
        );
        let responses = sm
            .apply(vec![
                Entry {
                    log_id: log_id(1),
                    payload: EntryPayload::Membership(membership),
                },
                set(2, "a"),
                normal(
                    3,
                    Command::TryLock {
                        key: "l".into(),
                        holder: "alice".into(),
                        ttl_ns: 10,
                        time_ns: 0,
                    },
                ),
            ])
            .await
            .unwrap();
        assert_eq!(
            responses,
            vec![
                Applied { index: 1, events: 0 },
                Applied { index: 2, events: 1 },
                Applied { index: 3, events: 1 },
            ]
        );

        let (last, membership) = sm.applied_state().await.unwrap();
        assert_eq!(last, Some(log_id(3)));
        assert_eq!(membership.log_id(), &Some(log_id(1)));
        assert_eq!(fsm.get("a").as_deref(), Some(&b"a"[..]));

        assert_eq!(
            events.next().await,
            Some(FsmEvent::kv(KvEventType::Set, "a", b"a".to_vec()))
        );
        assert_eq!(
            events.next().await,
            Some(FsmEvent::ha(HaEventType::Set, "l", "alice"))
        );
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        {
            let fsm = Arc::new(Fsm::new());
            let mut sm = StateMachineStore::open(fsm, Some(dir.path()), 2).await.unwrap();
            for index in 1..=3u64 {
                sm.apply(vec![set(index, &format!("k{index}"))]).await.unwrap();
                let snapshot = sm.get_snapshot_builder().await.build_snapshot().await.unwrap();
                assert_eq!(snapshot.meta.last_log_id, Some(log_id(index)));
            }
        }
        assert_eq!(snapshot_indexes(dir.path()).await.unwrap(), vec![2, 3]);

        let fsm = Arc::new(Fsm::new());
        let mut sm = StateMachineStore::open(fsm.clone(), Some(dir.path()), 2)
            .await
            .unwrap();
        assert_eq!(sm.last_applied(), Some(log_id(3)));
        assert_eq!(fsm.keys_with_prefix("k"), vec!["k1", "k2", "k3"]);
        let current = sm.get_current_snapshot().await.unwrap().unwrap();
        let body: serde_json::Value = serde_json::from_slice(current.snapshot.get_ref()).unwrap();
        assert!(body["ha_store"].is_object());
        assert_eq!(body["kv_store"]["k1"], "azE=");
    }

    #[tokio::test]
    async fn test_install_snapshot_replaces_state() {
        let source = Arc::new(Fsm::new());
        source.apply(&Command::KvSet {
            key: "remote".into(),
            value: b"1".to_vec(),
        });
        let data = serde_json::to_vec(&source.snapshot()).unwrap();

        let fsm = Arc::new(Fsm::new());
        fsm.apply(&Command::KvSet {
            key: "local".into(),
            value: b"2".to_vec(),
        });
        let mut sm = StateMachineStore::open(fsm.clone(), None, 1).await.unwrap();
        let meta = SnapshotMeta {
            last_log_id: Some(log_id(9)),
            last_membership: StoredMembership::default(),
            snapshot_id: "9-1".into(),
        };
        let mut buffer = sm.begin_receiving_snapshot().await.unwrap();
        buffer.get_mut().extend_from_slice(&data);
        sm.install_snapshot(&meta, buffer).await.unwrap();

        assert_eq!(sm.last_applied(), Some(log_id(9)));
        assert_eq!(fsm.keys_with_prefix(""), vec!["remote"]);
        assert_eq!(
            sm.get_current_snapshot().await.unwrap().unwrap().meta.snapshot_id,
            "9-1"
        );
    }

    #[test]
    fn test_snapshot_names() {
        assert_eq!(snapshot_name(42), "snapshot-00000000000000000042.json");
        assert_eq!(snapshot_index(&snapshot_name(42)), Some(42));
        assert_eq!(snapshot_index("snapshot-x.json"), None);
        assert_eq!(snapshot_index("raft.log"), None);
    }
}
