//! A running raft member: the openraft instance plus its FSM.
//!
//! Writes are proposed with `client_write`. A follower hands the command to
//! the current leader over HTTP and retries a few times while leadership is
//! unsettled.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::BasicNode;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::command::Command;
use super::fsm::Fsm;
use super::network::{
    fetch_raft_status, forward_join, forward_write, JoinRequest, NodeStatus, WriteRejected,
};
use super::types::{Applied, NodeId, Raft};
use crate::error::{PhysicalError, Result};

/// Attempts made for one proposal while no leader accepts it.
const PROPOSE_ATTEMPTS: usize = 5;
const PROPOSE_RETRY: Duration = Duration::from_millis(200);
/// How long a follower waits to apply an entry the leader committed for it.
const CATCH_UP_WAIT: Duration = Duration::from_secs(5);

pub struct RaftNode {
    id: NodeId,
    cluster_id: String,
    raft_addr: String,
    raft: Raft,
    fsm: Arc<Fsm>,
    client: Client,
    max_entry_size: usize,
    closed: AtomicBool,
}

impl RaftNode {
    pub(crate) fn new(
        id: NodeId,
        cluster_id: String,
        raft_addr: String,
        raft: Raft,
        fsm: Arc<Fsm>,
        client: Client,
        max_entry_size: usize,
    ) -> Self {
        Self {
            id,
            cluster_id,
            raft_addr,
            raft,
            fsm,
            client,
            max_entry_size,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn fsm(&self) -> &Fsm {
        &self.fsm
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == Some(self.id)
    }

    pub fn voters(&self) -> BTreeSet<NodeId> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    pub fn status(&self) -> NodeStatus {
        let metrics = self.raft.metrics().borrow().clone();
        NodeStatus {
            node_id: self.id,
            cluster_id: self.cluster_id.clone(),
            raft_addr: self.raft_addr.clone(),
            leader: metrics.current_leader,
            voters: metrics.membership_config.membership().voter_ids().collect(),
            last_applied: metrics.last_applied.map(|id| id.index),
        }
    }

    /// Make this node the sole voter of a new cluster. A node that already
    /// has raft state keeps it.
    pub(crate) async fn initialize(&self) -> Result<()> {
        let members = BTreeMap::from([(self.id, BasicNode::new(self.raft_addr.clone()))]);
        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(node_id = self.id, cluster_id = %self.cluster_id, "Bootstrapped raft cluster");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!(node_id = self.id, "raft state present, skipping bootstrap");
                Ok(())
            }
            Err(e) => Err(PhysicalError::NotReady(format!("raft bootstrap failed: {e}"))),
        }
    }

    /// Wait until a leader is known and this node is a voter.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let id = self.id;
        self.raft
            .wait(Some(timeout))
            .metrics(
                move |m| {
                    m.current_leader.is_some()
                        && m.membership_config.membership().voter_ids().any(|v| v == id)
                },
                "raft node ready",
            )
            .await
            .map(|_| ())
            .map_err(|e| PhysicalError::NotReady(format!("raft node {id} not ready: {e}")))
    }

    fn check_size(&self, command: &Command) -> Result<()> {
        let size = serde_json::to_vec(command)?.len();
        if size > self.max_entry_size {
            return Err(PhysicalError::too_large(
                command.subject(),
                size,
                self.max_entry_size,
            ));
        }
        Ok(())
    }

    /// Commit `command` through this node's own raft instance.
    pub(crate) async fn write_local(
        &self,
        command: Command,
    ) -> std::result::Result<Applied, (WriteRejected, Option<BasicNode>)> {
        if self.is_closed() {
            return Err((WriteRejected::Failed("raft node is closed".into()), None));
        }
        match self.raft.client_write(command).await {
            Ok(resp) => Ok(resp.data),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd))) => Err((
                WriteRejected::NotLeader(format!(
                    "node {} is not the leader (leader: {:?})",
                    self.id, fwd.leader_id
                )),
                fwd.leader_node,
            )),
            Err(e) => Err((WriteRejected::Failed(e.to_string()), None)),
        }
    }

    /// Replicate `command`, forwarding to the leader when this node is a
    /// follower.
    pub async fn propose(&self, command: Command) -> Result<Applied> {
        if self.is_closed() {
            return Err(PhysicalError::Closed);
        }
        self.check_size(&command)?;

        let mut last_error = None;
        for attempt in 1..=PROPOSE_ATTEMPTS {
            let leader = match self.write_local(command.clone()).await {
                Ok(applied) => return Ok(applied),
                Err((WriteRejected::NotLeader(msg), leader)) => {
                    last_error = Some(PhysicalError::NotReady(msg));
                    leader
                }
                Err((rejected, _)) => {
                    if self.is_closed() {
                        return Err(PhysicalError::Closed);
                    }
                    return Err(rejected.into());
                }
            };
            if let Some(leader) = leader {
                match forward_write(&self.client, &leader.addr, &command).await {
                    Ok(applied) => {
                        self.wait_applied(applied.index).await?;
                        return Ok(applied);
                    }
                    Err(e) if e.is_retryable() || e.kind() == crate::error::ErrorKind::NotReady => {
                        debug!(attempt, leader = %leader.addr, error = %e, "raft forward failed, retrying");
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            if self.is_closed() {
                return Err(PhysicalError::Closed);
            }
            tokio::time::sleep(PROPOSE_RETRY).await;
        }
        Err(last_error.unwrap_or_else(|| PhysicalError::NotReady("no raft leader".into())))
    }

    /// Wait until the local FSM has applied `index`, so a forwarded write
    /// is visible to reads on this node.
    async fn wait_applied(&self, index: u64) -> Result<()> {
        self.raft
            .wait(Some(CATCH_UP_WAIT))
            .applied_index_at_least(Some(index), "forwarded write applied")
            .await
            .map(|_| ())
            .map_err(|e| PhysicalError::NotReady(format!("entry {index} not applied locally: {e}")))
    }

    /// Bring the local FSM up to what the leader has applied.
    pub async fn sync(&self) -> Result<()> {
        if self.is_leader() {
            return Ok(());
        }
        let leader = self.leader_node().ok_or_else(|| {
            PhysicalError::NotReady(format!("node {} knows no raft leader", self.id))
        })?;
        let status = fetch_raft_status(&self.client, &leader.addr).await?;
        match status.last_applied {
            Some(index) => self.wait_applied(index).await,
            None => Ok(()),
        }
    }

    fn leader_node(&self) -> Option<BasicNode> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        metrics.membership_config.membership().get_node(&leader).cloned()
    }

    /// Add `req.node_id` as a voter, handing the request to the leader when
    /// this node is a follower.
    pub(crate) async fn add_voter(&self, req: JoinRequest) -> std::result::Result<(), WriteRejected> {
        if self.is_leader() {
            return self.add_voter_local(req).await;
        }
        let Some(leader) = self.leader_node() else {
            return Err(WriteRejected::NotLeader(format!(
                "node {} knows no raft leader",
                self.id
            )));
        };
        debug!(node_id = req.node_id, leader = %leader.addr, "forwarding raft join");
        forward_join(&self.client, &leader.addr, &req)
            .await
            .map_err(|e| match e {
                PhysicalError::NotReady(msg) => WriteRejected::NotLeader(msg),
                other => WriteRejected::Failed(other.to_string()),
            })
    }

    /// Add `req.node_id` as a voter. Only the leader accepts.
    pub(crate) async fn add_voter_local(
        &self,
        req: JoinRequest,
    ) -> std::result::Result<(), WriteRejected> {
        if !self.is_leader() {
            return Err(WriteRejected::NotLeader(format!(
                "node {} is not the leader (leader: {:?})",
                self.id,
                self.leader()
            )));
        }
        let mut voters = self.voters();
        if voters.contains(&req.node_id) {
            return Ok(());
        }
        self.raft
            .add_learner(req.node_id, BasicNode::new(req.raft_addr.clone()), true)
            .await
            .map_err(|e| WriteRejected::Failed(format!("adding learner {}: {e}", req.node_id)))?;
        voters.insert(req.node_id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| WriteRejected::Failed(format!("promoting {}: {e}", req.node_id)))?;
        info!(node_id = req.node_id, raft_addr = %req.raft_addr, "Added raft voter");
        Ok(())
    }

    pub(crate) async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.raft.shutdown().await {
            warn!(node_id = self.id, error = ?e, "raft shutdown failed");
        }
        info!(node_id = self.id, "Raft node stopped");
    }
}
