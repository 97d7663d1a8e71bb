//! HTTP endpoints a raft node serves.
//!
//! ```text
//! raft port
//! ├── POST /raft/append     - AppendEntries RPC
//! ├── POST /raft/snapshot   - InstallSnapshot RPC
//! ├── POST /raft/vote       - RequestVote RPC
//! ├── POST /raft/write      - commit a command forwarded by a follower
//! ├── POST /raft/join       - add a voter (leader only)
//! └── GET  /raft/status     - same document as the config port
//! config port
//! ├── GET  /v1/raft/status  - node id, leader and voters
//! └── POST /v1/raft/join    - add the caller as a voter
//! ```

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::command::Command;
use super::network::{JoinRequest, NodeStatus, WriteRejected};
use super::node::RaftNode;
use super::types::{Applied, NodeId, TypeConfig};

type NodeState = State<Arc<RaftNode>>;

pub(crate) fn raft_router(node: Arc<RaftNode>) -> Router {
    Router::new()
        .route("/raft/append", post(append))
        .route("/raft/snapshot", post(snapshot))
        .route("/raft/vote", post(vote))
        .route("/raft/write", post(write))
        .route("/raft/join", post(join_local))
        .route("/raft/status", get(status))
        .with_state(node)
}

pub(crate) fn config_router(node: Arc<RaftNode>) -> Router {
    Router::new()
        .route("/v1/raft/status", get(status))
        .route("/v1/raft/join", post(join))
        .with_state(node)
}

/// Serve `router` on `listener` until `stop` fires.
pub(crate) fn spawn_server(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    stop: CancellationToken,
) {
    let addr = listener.local_addr().ok();
    tokio::spawn(async move {
        info!(server = name, addr = ?addr, "Raft endpoint listening");
        let shutdown = async move { stop.cancelled().await };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(server = name, error = %e, "raft endpoint stopped with error");
        }
    });
}

async fn append(
    State(node): NodeState,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    Json(node.raft().append_entries(req).await)
}

async fn snapshot(
    State(node): NodeState,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>> {
    Json(node.raft().install_snapshot(req).await)
}

async fn vote(
    State(node): NodeState,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Json<Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(node.raft().vote(req).await)
}

async fn write(
    State(node): NodeState,
    Json(command): Json<Command>,
) -> Json<Result<Applied, WriteRejected>> {
    Json(node.write_local(command).await.map_err(|(rejected, _)| rejected))
}

async fn status(State(node): NodeState) -> Json<NodeStatus> {
    Json(node.status())
}

async fn join(
    State(node): NodeState,
    Json(req): Json<JoinRequest>,
) -> Json<Result<(), WriteRejected>> {
    Json(node.add_voter(req).await)
}

async fn join_local(
    State(node): NodeState,
    Json(req): Json<JoinRequest>,
) -> Json<Result<(), WriteRejected>> {
    Json(node.add_voter_local(req).await)
}
