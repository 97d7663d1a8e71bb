//! Raft-replicated backend on openraft.
//!
//! The backend is the state machine: writes are committed through
//! `Raft::client_write` and applied to every member's [`Fsm`], reads are
//! served from the local FSM. Followers hand writes to the leader over the
//! raft port. HA locks live in the FSM's lock map and are freed by a stale
//! sweep the leader runs while their holder stops refreshing them.
//!
//! Each node listens on two ports: `raft_port` carries raft RPCs and
//! forwarded writes, `config_port` serves cluster status and accepts join
//! requests. A node started with `bootstrap_node` (or without peers) forms
//! a new cluster; the others join through the config endpoints listed in
//! `peers`.

mod command;
mod fsm;
mod lock;
mod network;
mod node;
mod observer;
mod server;
mod state_machine;
mod storage;
mod types;

pub use command::{Command, TxnCommand};
pub use fsm::{Fsm, FsmSnapshot, HaRecord};
pub use lock::{RaftLock, REFRESH_INTERVAL};
pub use network::{
    fetch_status, HttpNetworkFactory, HttpRaftNetwork, JoinRequest, NodeStatus, WriteRejected,
};
pub use node::RaftNode;
pub use observer::{FsmEvent, HaEventType, KvEventType, Subscription};
pub use state_machine::StateMachineStore;
pub use storage::LogStore;
pub use types::{Applied, NodeId, TypeConfig};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::SnapshotPolicy;
use reqwest::Url;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::{PhysicalError, Result};
use crate::lock::Lock;
use crate::permit::PermitPool;
use crate::store::{validate_key, Backend, Entry, HaBackend, Operation, Transactional, TxnEntry};
use crate::telemetry::measure;
use crate::util::list_segments;
use lock::now_nanos;
use network::{http_client, request_join};
use types::Raft;

pub const DEFAULT_MAX_ENTRY_SIZE: usize = 1024 * 1024;
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_SNAPSHOT_MIN_LOGS: u64 = 8192;
pub const DEFAULT_RETAINED_SNAPSHOTS: usize = 2;
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15);
pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
/// Period of the stale-lock sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
/// How long opening a backend waits for it to become a voter with a known
/// leader before returning anyway.
pub const STARTUP_WAIT: Duration = Duration::from_secs(10);
const JOIN_RETRY: Duration = Duration::from_secs(1);

const NODE_ID_FILE: &str = "node-id";

/// Parsed raft driver settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RaftConfig {
    pub config_port: u16,
    pub raft_port: u16,
    pub listen_host: String,
    /// Host other members use to reach this node.
    pub advertise_host: String,
    pub node_id: Option<NodeId>,
    pub cluster_id: String,
    /// Config endpoints of existing members.
    pub peers: Vec<Url>,
    pub bootstrap: bool,
    pub data_dir: Option<PathBuf>,
    pub snapshot_interval: Duration,
    pub snapshot_min_logs: u64,
    pub retained_snapshots: usize,
    pub max_entry_size: usize,
    pub lock_ttl: Duration,
    pub max_parallel: usize,
}

fn port(conf: &BackendConfig, key: &str) -> Result<u16> {
    let raw = conf.require(key)?;
    raw.trim()
        .parse()
        .map_err(|e| PhysicalError::Config(format!("failed parsing '{key}' = {raw:?}: {e}")))
}

impl RaftConfig {
    pub fn from_config(conf: &BackendConfig) -> Result<Self> {
        let peers = conf
            .get("peers")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                Url::parse(p).map_err(|e| PhysicalError::Config(format!("invalid peer {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let listen_host = conf.get_or("listen_host", DEFAULT_LISTEN_HOST).to_string();
        Ok(Self {
            config_port: port(conf, "config_port")?,
            raft_port: port(conf, "raft_port")?,
            advertise_host: conf.get_or("advertise_host", &listen_host).to_string(),
            listen_host,
            node_id: conf.parse("id")?,
            cluster_id: conf.get_or("cluster_id", "default").to_string(),
            peers,
            bootstrap: conf.parse_bool("bootstrap_node")?,
            data_dir: conf.get("data_dir").map(PathBuf::from),
            snapshot_interval: conf.parse_duration("snapshot_interval", DEFAULT_SNAPSHOT_INTERVAL)?,
            snapshot_min_logs: conf.parse_or("snapshot_min_committed_logs", DEFAULT_SNAPSHOT_MIN_LOGS)?,
            retained_snapshots: conf.parse_or("max_retained_snapshots", DEFAULT_RETAINED_SNAPSHOTS)?,
            max_entry_size: conf.parse_or("max_entry_size", DEFAULT_MAX_ENTRY_SIZE)?,
            lock_ttl: conf.parse_duration("lock_ttl", DEFAULT_LOCK_TTL)?,
            max_parallel: conf.max_parallel()?,
        })
    }

    /// The configured id, else the one persisted in `data_dir`, else a new
    /// one (persisted when there is a `data_dir`).
    async fn resolve_node_id(&self) -> Result<NodeId> {
        if let Some(id) = self.node_id {
            return Ok(id);
        }
        let Some(dir) = &self.data_dir else {
            return Ok(rand::random());
        };
        let path = dir.join(NODE_ID_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw.trim().parse().map_err(|e| {
                PhysicalError::Config(format!("invalid node id file {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let id: NodeId = rand::random();
                tokio::fs::create_dir_all(dir).await?;
                tokio::fs::write(&path, id.to_string()).await?;
                Ok(id)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn forms_cluster(&self) -> bool {
        self.bootstrap || self.peers.is_empty()
    }

    fn openraft_config(&self) -> Result<openraft::Config> {
        openraft::Config {
            cluster_name: self.cluster_id.clone(),
            heartbeat_interval: 250,
            election_timeout_min: 500,
            election_timeout_max: 1000,
            snapshot_policy: SnapshotPolicy::Never,
            ..Default::default()
        }
        .validate()
        .map_err(|e| PhysicalError::Config(format!("invalid raft settings: {e}")))
    }
}

/// Raft implementation of Backend.
pub struct RaftBackend {
    node: Arc<RaftNode>,
    config: RaftConfig,
    config_addr: SocketAddr,
    permit_pool: PermitPool,
    tasks: CancellationToken,
}

impl RaftBackend {
    pub async fn new(conf: &BackendConfig) -> Result<Self> {
        Self::start(RaftConfig::from_config(conf)?).await
    }

    /// Start a node: bind both ports, open storage, then bootstrap or join.
    pub async fn start(config: RaftConfig) -> Result<Self> {
        let node_id = config.resolve_node_id().await?;
        let raft_listener = TcpListener::bind((config.listen_host.as_str(), config.raft_port)).await?;
        let config_listener =
            TcpListener::bind((config.listen_host.as_str(), config.config_port)).await?;
        let raft_addr = format!(
            "{}:{}",
            config.advertise_host,
            raft_listener.local_addr()?.port()
        );
        let config_addr = config_listener.local_addr()?;

        let fsm = Arc::new(Fsm::new());
        let log_store = match &config.data_dir {
            Some(dir) => LogStore::open(dir).await?,
            None => LogStore::in_memory(),
        };
        let state_machine =
            StateMachineStore::open(fsm.clone(), config.data_dir.as_deref(), config.retained_snapshots)
                .await?;

        let client = http_client()?;
        let raft = Raft::new(
            node_id,
            Arc::new(config.openraft_config()?),
            HttpNetworkFactory::new(client.clone()),
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| PhysicalError::NotReady(format!("failed to start raft node {node_id}: {e}")))?;

        let node = Arc::new(RaftNode::new(
            node_id,
            config.cluster_id.clone(),
            raft_addr,
            raft,
            fsm,
            client,
            config.max_entry_size,
        ));
        let tasks = CancellationToken::new();
        server::spawn_server("raft", raft_listener, server::raft_router(node.clone()), tasks.clone());
        server::spawn_server(
            "config",
            config_listener,
            server::config_router(node.clone()),
            tasks.clone(),
        );
        info!(
            node_id,
            cluster_id = %config.cluster_id,
            raft_addr = %node.raft_addr(),
            config_addr = %config_addr,
            bootstrap = config.bootstrap,
            peers = config.peers.len(),
            "Opened raft backend"
        );

        let backend = Self {
            node,
            permit_pool: PermitPool::new(config.max_parallel),
            config,
            config_addr,
            tasks,
        };
        if backend.config.forms_cluster() {
            backend.node.initialize().await?;
        } else {
            backend.spawn_join();
        }
        if let Err(e) = backend.node.wait_ready(STARTUP_WAIT).await {
            warn!(node_id, error = %e, "raft node not ready yet, continuing");
        }
        backend.spawn_stale_sweep();
        backend.spawn_snapshotter();
        Ok(backend)
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    pub fn fsm(&self) -> &Fsm {
        self.node.fsm()
    }

    /// Address the config endpoint is bound to.
    pub fn config_addr(&self) -> SocketAddr {
        self.config_addr
    }

    pub fn status(&self) -> NodeStatus {
        self.node.status()
    }

    fn spawn_join(&self) {
        let node = self.node.clone();
        let peers = self.config.peers.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let req = JoinRequest {
                node_id: node.id(),
                raft_addr: node.raft_addr().to_string(),
            };
            loop {
                for peer in &peers {
                    match request_join(node.client(), peer, &req).await {
                        Ok(()) => {
                            info!(node_id = req.node_id, peer = %peer, "Joined raft cluster");
                            return;
                        }
                        Err(e) => debug!(peer = %peer, error = %e, "raft join attempt failed"),
                    }
                }
                tokio::select! {
                    _ = tasks.cancelled() => return,
                    _ = tokio::time::sleep(JOIN_RETRY) => {}
                }
            }
        });
    }

    fn spawn_stale_sweep(&self) {
        let node = self.node.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tasks.cancelled() => return,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
                let now = now_nanos();
                if !node.is_leader() || !node.fsm().has_stale_locks(now) {
                    continue;
                }
                if let Err(e) = node.propose(Command::ReleaseStale { time_ns: now }).await {
                    warn!(error = %e, "failed to release stale raft locks");
                }
            }
        });
    }

    fn spawn_snapshotter(&self) {
        if self.config.data_dir.is_none() {
            return;
        }
        let node = self.node.clone();
        let tasks = self.tasks.clone();
        let interval = self.config.snapshot_interval;
        let min_logs = self.config.snapshot_min_logs;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tasks.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let (applied, snapshot) = {
                    let metrics = node.raft().metrics().borrow().clone();
                    (
                        metrics.last_applied.map(|id| id.index).unwrap_or_default(),
                        metrics.snapshot.map(|id| id.index).unwrap_or_default(),
                    )
                };
                if applied.saturating_sub(snapshot) < min_logs {
                    continue;
                }
                debug!(node_id = node.id(), applied, snapshot, "triggering raft snapshot");
                if let Err(e) = node.raft().trigger().snapshot().await {
                    warn!(node_id = node.id(), error = %e, "raft snapshot failed");
                }
            }
        });
    }
}

#[async_trait]
impl Backend for RaftBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure("raft", "put");
        validate_key(&entry.key)?;
        let _permit = self.permit_pool.acquire().await?;

        self.node
            .propose(Command::KvSet {
                key: entry.key,
                value: entry.value,
            })
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _timer = measure("raft", "get");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        Ok(self.fsm().get(key).map(|value| Entry::new(key, value)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure("raft", "delete");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        self.node
            .propose(Command::KvDelete { key: key.to_string() })
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure("raft", "list");
        let _permit = self.permit_pool.acquire().await?;

        Ok(list_segments(self.fsm().keys_with_prefix(prefix), prefix))
    }

    async fn close(&self) -> Result<()> {
        self.tasks.cancel();
        self.permit_pool.close();
        self.node.shutdown().await;
        Ok(())
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }

    fn as_ha(&self) -> Option<&dyn HaBackend> {
        Some(self)
    }
}

#[async_trait]
impl Transactional for RaftBackend {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        let _timer = measure("raft", "transaction");
        let ops = txns
            .into_iter()
            .map(|txn| {
                validate_key(&txn.entry.key)?;
                match txn.operation {
                    Operation::Put => Ok(TxnCommand::Set {
                        key: txn.entry.key,
                        value: txn.entry.value,
                    }),
                    Operation::Delete => Ok(TxnCommand::Delete { key: txn.entry.key }),
                    other => Err(PhysicalError::Unsupported(format!(
                        "operation {other} is not allowed in a transaction"
                    ))),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        if ops.is_empty() {
            return Ok(());
        }

        let _permit = self.permit_pool.acquire().await?;
        self.node.propose(Command::KvTxn { ops }).await?;
        Ok(())
    }
}

impl HaBackend for RaftBackend {
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>> {
        validate_key(key)?;
        Ok(Box::new(RaftLock::new(
            self.node.clone(),
            key.to_string(),
            value.to_string(),
            self.config.lock_ttl,
        )))
    }

    fn ha_enabled(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        exercise_backend, exercise_backend_list_prefix, exercise_ha_backend,
        exercise_transactional_backend,
    };
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn conf(extra: &[(&str, &str)]) -> BackendConfig {
        let mut values = HashMap::from([
            ("config_port".to_string(), "0".to_string()),
            ("raft_port".to_string(), "0".to_string()),
        ]);
        values.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        BackendConfig::from(values)
    }

    async fn single() -> RaftBackend {
        RaftBackend::new(&conf(&[])).await.unwrap()
    }

    /// Start a node that joins through `via`'s config endpoint.
    async fn join(via: &RaftBackend, extra: &[(&str, &str)]) -> RaftBackend {
        let peer = format!("http://{}", via.config_addr());
        let mut values = vec![("peers", peer.as_str())];
        values.extend_from_slice(extra);
        let node = RaftBackend::new(&conf(&values)).await.unwrap();
        node.node().wait_ready(STARTUP_WAIT).await.unwrap();
        node
    }

    async fn pair() -> (RaftBackend, RaftBackend) {
        let a = RaftBackend::new(&conf(&[("bootstrap_node", "true")])).await.unwrap();
        let b = join(&a, &[]).await;
        (a, b)
    }

    async fn eventually_get(backend: &RaftBackend, key: &str) -> Option<Vec<u8>> {
        for _ in 0..50 {
            if let Some(entry) = backend.get(key).await.unwrap() {
                return Some(entry.value);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_raft_conformance() {
        let a = single().await;
        exercise_backend(&a).await;
        exercise_backend_list_prefix(&a).await;
        exercise_transactional_backend(&a).await;
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_follower_conformance() {
        let (a, b) = pair().await;
        exercise_backend(&b).await;
        exercise_transactional_backend(&b).await;
        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_replicate_between_nodes() {
        let (a, b) = pair().await;
        assert!(a.node().is_leader());

        a.put(Entry::new("x", b"1".to_vec())).await.unwrap();
        assert_eq!(eventually_get(&b, "x").await.as_deref(), Some(&b"1"[..]));

        // Written on the follower, committed by the leader.
        b.put(Entry::new("y", b"2".to_vec())).await.unwrap();
        assert_eq!(b.get("y").await.unwrap().unwrap().value, b"2");
        assert_eq!(a.get("y").await.unwrap().unwrap().value, b"2");

        b.delete("x").await.unwrap();
        assert!(a.get("x").await.unwrap().is_none());
        assert!(b.get("x").await.unwrap().is_none());

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_status() {
        let (a, b) = pair().await;
        let peer = Url::parse(&format!("http://{}", b.config_addr())).unwrap();
        let status = fetch_status(&http_client().unwrap(), &peer).await.unwrap();
        assert_eq!(status.node_id, b.node_id());
        assert_eq!(status.cluster_id, "default");
        assert_eq!(status.leader, Some(a.node_id()));
        let mut voters = vec![a.node_id(), b.node_id()];
        voters.sort_unstable();
        assert_eq!(status.voters, voters);
        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_raft_ha() {
        let (a, b) = pair().await;
        exercise_ha_backend(&a, &b).await;
        exercise_ha_backend(&b, &a).await;
    }

    #[tokio::test]
    async fn test_leader_hand_off() {
        let (a, b) = pair().await;
        let lock_a = a.lock_with("leader", "alice").unwrap();
        let lost_a = lock_a.lock(CancellationToken::new()).await.unwrap().unwrap();

        let lock_b = b.lock_with("leader", "bob").unwrap();
        let waiter = tokio::spawn(async move {
            let leader = lock_b.lock(CancellationToken::new()).await;
            (lock_b, leader)
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        lock_a.unlock().await.unwrap();
        lost_a.lost().await;
        let (lock_b, leader) = tokio::time::timeout(REFRESH_INTERVAL * 4, waiter)
            .await
            .expect("bob acquires after alice unlocks")
            .unwrap();
        assert!(leader.unwrap().is_some());
        assert_eq!(lock_b.value().await.unwrap(), (true, "bob".to_string()));
        lock_b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_swept() {
        let a = RaftBackend::new(&conf(&[("bootstrap_node", "true")])).await.unwrap();
        let b = join(&a, &[("lock_ttl", "1s")]).await;
        // c joins through a follower, which hands the request to the leader.
        let c = join(&b, &[]).await;
        assert_eq!(c.node().voters().len(), 3);

        let lock_b = b.lock_with("leader", "bob").unwrap();
        let lost_b = lock_b.lock(CancellationToken::new()).await.unwrap().unwrap();
        // bob's node goes away without unlocking; its refreshes stop.
        b.close().await.unwrap();

        let lock_c = c.lock_with("leader", "carol").unwrap();
        tokio::time::timeout(Duration::from_secs(10), lock_c.lock(CancellationToken::new()))
            .await
            .expect("stale lock swept")
            .unwrap()
            .unwrap();
        assert_eq!(lock_c.value().await.unwrap(), (true, "carol".to_string()));
        tokio::time::timeout(Duration::from_secs(5), lost_b.lost())
            .await
            .expect("bob sees the lock is gone");
    }

    #[tokio::test]
    async fn test_entry_too_large() {
        let a = single().await;
        let err = a
            .put(Entry::new("big", vec![0u8; DEFAULT_MAX_ENTRY_SIZE]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TooLarge);
    }

    #[tokio::test]
    async fn test_restart_from_data_dir() {
        let dir = TempDir::new().unwrap();
        let conf = conf(&[
            ("data_dir", dir.path().to_str().unwrap()),
            ("snapshot_min_committed_logs", "2"),
        ]);
        let first_id = {
            let b = RaftBackend::new(&conf).await.unwrap();
            b.put(Entry::new("a/b", b"1".to_vec())).await.unwrap();
            b.put(Entry::new("c", b"2".to_vec())).await.unwrap();
            b.put(Entry::new("d", b"3".to_vec())).await.unwrap();
            b.close().await.unwrap();
            b.node_id()
        };

        let b = RaftBackend::new(&conf).await.unwrap();
        assert_eq!(b.node_id(), first_id);
        assert_eq!(eventually_get(&b, "d").await.as_deref(), Some(&b"3"[..]));
        assert_eq!(b.list("").await.unwrap(), vec!["a/", "c", "d"]);
        assert_eq!(b.get("a/b").await.unwrap().unwrap().value, b"1");

        b.put(Entry::new("e", b"4".to_vec())).await.unwrap();
        assert_eq!(b.get("e").await.unwrap().unwrap().value, b"4");
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed() {
        let a = single().await;
        a.close().await.unwrap();
        let err = a.put(Entry::new("k", b"v".to_vec())).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Closed);
        let err = a.node().propose(Command::KvDelete { key: "k".into() }).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Closed);
    }

    #[test]
    fn test_config() {
        let c = RaftConfig::from_config(&BackendConfig::from([
            ("config_port", "8202"),
            ("raft_port", "8201"),
            ("id", "7"),
            ("listen_host", "0.0.0.0"),
            ("advertise_host", "10.0.0.3"),
            ("peers", "http://10.0.0.1:8202, http://10.0.0.2:8202"),
            ("bootstrap_node", "true"),
            ("snapshot_interval", "30s"),
            ("max_retained_snapshots", "5"),
        ]))
        .unwrap();
        assert_eq!(c.node_id, Some(7));
        assert_eq!(c.listen_host, "0.0.0.0");
        assert_eq!(c.advertise_host, "10.0.0.3");
        assert_eq!(c.peers.len(), 2);
        assert!(c.bootstrap);
        assert!(c.forms_cluster());
        assert_eq!(c.snapshot_interval, Duration::from_secs(30));
        assert_eq!(c.retained_snapshots, 5);
        assert_eq!(c.max_entry_size, DEFAULT_MAX_ENTRY_SIZE);
        assert!(c.openraft_config().is_ok());

        let c = RaftConfig::from_config(&BackendConfig::from([
            ("config_port", "8202"),
            ("raft_port", "8201"),
            ("peers", "http://10.0.0.1:8202"),
        ]))
        .unwrap();
        assert_eq!(c.listen_host, DEFAULT_LISTEN_HOST);
        assert_eq!(c.advertise_host, DEFAULT_LISTEN_HOST);
        assert!(!c.forms_cluster());

        assert!(RaftConfig::from_config(&BackendConfig::from([("raft_port", "8201")])).is_err());
        assert!(RaftConfig::from_config(&BackendConfig::from([
            ("config_port", "x"),
            ("raft_port", "8201")
        ]))
        .is_err());
        assert!(RaftConfig::from_config(&BackendConfig::from([
            ("config_port", "1"),
            ("raft_port", "2"),
            ("id", "node-a")
        ]))
        .is_err());
        assert!(RaftConfig::from_config(&BackendConfig::from([
            ("config_port", "1"),
            ("raft_port", "2"),
            ("peers", "not a url")
        ]))
        .is_err());
    }

    #[tokio::test]
    async fn test_node_id_persisted() {
        let dir = TempDir::new().unwrap();
        let mut c = RaftConfig::from_config(&conf(&[("data_dir", dir.path().to_str().unwrap())]))
            .unwrap();
        let first = c.resolve_node_id().await.unwrap();
        assert_eq!(c.resolve_node_id().await.unwrap(), first);
        c.node_id = Some(3);
        assert_eq!(c.resolve_node_id().await.unwrap(), 3);
    }
}
