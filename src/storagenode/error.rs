use crate::config::ConfigError;
use crate::executor::ExecutorError;
use crate::types::{ClusterId, LogStreamId, StorageNodeId, TopicId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageNodeError {
    #[error("storage node: cluster id mismatch (expected {expected}, got {actual})")]
    ClusterMismatch {
        expected: ClusterId,
        actual: ClusterId,
    },
    #[error("storage node: storage node id mismatch (expected {expected}, got {actual})")]
    StorageNodeMismatch {
        expected: StorageNodeId,
        actual: StorageNodeId,
    },
    #[error("storage node: log stream {0} already exists")]
    LogStreamExists(LogStreamId),
    #[error("storage node: log stream {0} not found")]
    LogStreamNotFound(LogStreamId),
    #[error("storage node: log stream {log_stream_id} does not belong to topic {topic_id}")]
    TopicMismatch {
        topic_id: TopicId,
        log_stream_id: LogStreamId,
    },
    #[error("storage node: unknown volume {0}")]
    UnknownVolume(String),
    #[error("storage node: {0} unreachable")]
    Unreachable(StorageNodeId),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
