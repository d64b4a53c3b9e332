use crate::raft::error::RaftError;
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    ProposeRequest, RequestVoteRequest, RequestVoteResponse,
};
use crate::types::NodeId;
use async_trait::async_trait;
use log::debug;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// Outbound side of raft messaging, one instance per member.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(
        &self,
        to: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError>;

    async fn append_entries(
        &self,
        to: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError>;

    async fn install_snapshot(
        &self,
        to: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError>;

    /// Hands a proposal to the leader; returns the log index it was given.
    async fn propose(&self, to: NodeId, request: ProposeRequest) -> Result<u64, RaftError>;
}

/// Inbound side: what a member does with a message addressed to it.
pub trait RaftMessageHandler: Send + Sync {
    fn handle_request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse, RaftError>;

    fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError>;

    fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError>;

    fn handle_propose(&self, request: ProposeRequest) -> Result<u64, RaftError>;
}

/// In-process raft network. Members register a weak handler; isolated
/// members can neither send nor receive. Clones share the routing table.
#[derive(Clone, Default)]
pub struct LocalRaftNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    routes: RwLock<HashMap<NodeId, Weak<dyn RaftMessageHandler>>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl LocalRaftNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: NodeId, handler: Weak<dyn RaftMessageHandler>) {
        self.inner.routes.write().insert(node_id, handler);
    }

    pub fn unregister(&self, node_id: NodeId) {
        self.inner.routes.write().remove(&node_id);
    }

    pub fn isolate(&self, node_id: NodeId) {
        debug!("event=raft_network_isolate node_id={node_id}");
        self.inner.isolated.write().insert(node_id);
    }

    pub fn heal(&self, node_id: NodeId) {
        debug!("event=raft_network_heal node_id={node_id}");
        self.inner.isolated.write().remove(&node_id);
    }

    pub fn is_isolated(&self, node_id: NodeId) -> bool {
        self.inner.isolated.read().contains(&node_id)
    }

    /// Transport handle that sends as `from`.
    pub fn transport(&self, from: NodeId) -> Arc<dyn RaftTransport> {
        Arc::new(LocalRaftTransport {
            from,
            network: self.clone(),
        })
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<dyn RaftMessageHandler>, RaftError> {
        {
            let isolated = self.inner.isolated.read();
            if isolated.contains(&from) || isolated.contains(&to) {
                return Err(RaftError::Unreachable(to));
            }
        }
        self.inner
            .routes
            .read()
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or(RaftError::Unreachable(to))
    }
}

struct LocalRaftTransport {
    from: NodeId,
    network: LocalRaftNetwork,
}

#[async_trait]
impl RaftTransport for LocalRaftTransport {
    async fn request_vote(
        &self,
        to: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        self.network.route(self.from, to)?.handle_request_vote(request)
    }

    async fn append_entries(
        &self,
        to: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        self.network.route(self.from, to)?.handle_append_entries(request)
    }

    async fn install_snapshot(
        &self,
        to: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        self.network.route(self.from, to)?.handle_install_snapshot(request)
    }

    async fn propose(&self, to: NodeId, request: ProposeRequest) -> Result<u64, RaftError> {
        self.network.route(self.from, to)?.handle_propose(request)
    }
}
