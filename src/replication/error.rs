use crate::types::{LogStreamId, StorageNodeId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("replication: replicator stopped")]
    Stopped,
    #[error("replication: connection closed")]
    ConnectionClosed,
    #[error("replication: no route to storage node {storage_node_id} log stream {log_stream_id}")]
    Unreachable {
        storage_node_id: StorageNodeId,
        log_stream_id: LogStreamId,
    },
    #[error("replication: rejected by replica: {0}")]
    Rejected(String),
    #[error("replication: cancelled")]
    Cancelled,
}
