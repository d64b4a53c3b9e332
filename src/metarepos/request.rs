use crate::metarepos::error::MetadataError;
use crate::proto::{LogStreamDescriptor, StorageNodeDescriptor, StorageNodeUncommitReport};
use crate::types::{Glsn, LogStreamId, NodeId, StorageNodeId, TopicId};
use serde::{Deserialize, Serialize};

/// Every change to the replicated metadata goes through one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    RegisterStorageNode {
        storage_node: StorageNodeDescriptor,
    },
    UnregisterStorageNode {
        storage_node_id: StorageNodeId,
    },
    RegisterTopic {
        topic_id: TopicId,
    },
    UnregisterTopic {
        topic_id: TopicId,
    },
    RegisterLogStream {
        log_stream: LogStreamDescriptor,
    },
    UnregisterLogStream {
        log_stream_id: LogStreamId,
    },
    /// Replaces the replica set of a sealed log stream.
    UpdateLogStream {
        log_stream: LogStreamDescriptor,
    },
    Report {
        reports: Vec<StorageNodeUncommitReport>,
    },
    /// Runs one global commit round over the applied reports.
    Commit,
    Seal {
        log_stream_id: LogStreamId,
    },
    Unseal {
        log_stream_id: LogStreamId,
    },
    AddPeer {
        node_id: NodeId,
        url: String,
        #[serde(default)]
        learner: bool,
    },
    RemovePeer {
        node_id: NodeId,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::RegisterStorageNode { .. } => "register_storage_node",
            Request::UnregisterStorageNode { .. } => "unregister_storage_node",
            Request::RegisterTopic { .. } => "register_topic",
            Request::UnregisterTopic { .. } => "unregister_topic",
            Request::RegisterLogStream { .. } => "register_log_stream",
            Request::UnregisterLogStream { .. } => "unregister_log_stream",
            Request::UpdateLogStream { .. } => "update_log_stream",
            Request::Report { .. } => "report",
            Request::Commit => "commit",
            Request::Seal { .. } => "seal",
            Request::Unseal { .. } => "unseal",
            Request::AddPeer { .. } => "add_peer",
            Request::RemovePeer { .. } => "remove_peer",
        }
    }
}

/// The raft payload: who proposed it and under which request id, so the
/// proposer's apply loop can wake the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub node_index: NodeId,
    pub request_id: u64,
    pub body: Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutput {
    Done,
    LastCommitted(Glsn),
}

pub type ApplyResult = Result<ApplyOutput, MetadataError>;
