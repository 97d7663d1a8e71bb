//! HTTP transport between raft nodes.
//!
//! Raft RPCs are JSON `POST`s to `/raft/{append,snapshot,vote}` on a peer's
//! raft port, answered with a serialized `Result`. The same port accepts
//! `/raft/write` and `/raft/join` so followers can hand a command or a join
//! request to the leader. Joining nodes `POST` to `/v1/raft/join` on a
//! peer's config port.

use std::time::Duration;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::command::Command;
use super::types::{Applied, NodeId, TypeConfig};
use crate::error::{PhysicalError, Result};

/// Per-request timeout for raft and admin RPCs.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a node refused a forwarded write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", content = "message", rename_all = "snake_case")]
pub enum WriteRejected {
    /// The receiver is not the leader either.
    NotLeader(String),
    /// The command was rejected or could not be committed.
    Failed(String),
}

impl From<WriteRejected> for PhysicalError {
    fn from(err: WriteRejected) -> Self {
        match err {
            WriteRejected::NotLeader(msg) => PhysicalError::NotReady(msg),
            WriteRejected::Failed(msg) => PhysicalError::Protocol(msg),
        }
    }
}

/// Body of a join request sent to a cluster member's config port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub raft_addr: String,
}

/// A node's view of the cluster, served on its config port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub cluster_id: String,
    pub raft_addr: String,
    pub leader: Option<NodeId>,
    pub voters: Vec<NodeId>,
    pub last_applied: Option<u64>,
}

pub(crate) fn http_client() -> Result<Client> {
    Client::builder()
        .no_proxy()
        .timeout(RPC_TIMEOUT)
        .build()
        .map_err(|e| PhysicalError::Config(format!("failed to build raft http client: {e}")))
}

/// Send `command` to the node serving raft at `addr`.
pub(crate) async fn forward_write(client: &Client, addr: &str, command: &Command) -> Result<Applied> {
    let url = format!("http://{addr}/raft/write");
    debug!(%url, %command, "forwarding raft write");
    let reply: std::result::Result<Applied, WriteRejected> = client
        .post(url)
        .json(command)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    reply.map_err(PhysicalError::from)
}

/// Hand a join request to the leader serving raft at `addr`.
pub(crate) async fn forward_join(client: &Client, addr: &str, req: &JoinRequest) -> Result<()> {
    let reply: std::result::Result<(), WriteRejected> = client
        .post(format!("http://{addr}/raft/join"))
        .json(req)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    reply.map_err(PhysicalError::from)
}

/// Ask the member whose config endpoint is `peer` to add us as a voter.
pub(crate) async fn request_join(client: &Client, peer: &Url, req: &JoinRequest) -> Result<()> {
    let url = peer
        .join("v1/raft/join")
        .map_err(|e| PhysicalError::Config(format!("invalid peer url {peer}: {e}")))?;
    let reply: std::result::Result<(), WriteRejected> = client
        .post(url)
        .json(req)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    reply.map_err(PhysicalError::from)
}

/// Fetch the status document of the member whose config endpoint is `peer`.
pub async fn fetch_status(client: &Client, peer: &Url) -> Result<NodeStatus> {
    let url = peer
        .join("v1/raft/status")
        .map_err(|e| PhysicalError::Config(format!("invalid peer url {peer}: {e}")))?;
    Ok(client.get(url).send().await?.error_for_status()?.json().await?)
}

/// Fetch the status document from the node serving raft at `addr`.
pub(crate) async fn fetch_raft_status(client: &Client, addr: &str) -> Result<NodeStatus> {
    Ok(client
        .get(format!("http://{addr}/raft/status"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?)
}

/// Builds one [`HttpRaftNetwork`] per target node.
pub struct HttpNetworkFactory {
    client: Client,
}

impl HttpNetworkFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpRaftNetwork;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        HttpRaftNetwork {
            addr: node.addr.clone(),
            client: self.client.clone(),
            target,
        }
    }
}

pub struct HttpRaftNetwork {
    addr: String,
    client: Client,
    target: NodeId,
}

impl HttpRaftNetwork {
    async fn request<Req, Resp, Err>(
        &self,
        path: &str,
        req: Req,
    ) -> std::result::Result<Resp, RPCError<NodeId, BasicNode, Err>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        Err: std::error::Error + DeserializeOwned,
    {
        let url = format!("http://{}/raft/{}", self.addr, path);
        let resp = self
            .client
            .post(url)
            .json(&req)
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() {
                    RPCError::Unreachable(Unreachable::new(&err))
                } else {
                    RPCError::Network(NetworkError::new(&err))
                }
            })?;

        let res: std::result::Result<Resp, Err> = resp
            .json()
            .await
            .map_err(|err| RPCError::Network(NetworkError::new(&err)))?;
        res.map_err(|err| RPCError::RemoteError(RemoteError::new(self.target, err)))
    }
}

impl RaftNetwork<TypeConfig> for HttpRaftNetwork {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        self.request("append", req).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.request("snapshot", req).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> std::result::Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        self.request("vote", req).await
    }
}
