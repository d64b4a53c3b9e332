use crate::config::ConfigError;
use crate::metarepos::RepositoryError;
use crate::storagenode::StorageNodeError;
use crate::types::{LogStreamId, StorageNodeId, TopicId};
use thiserror::Error;

/// Failure of an administrative flow, tagged with the component that
/// refused the step.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("admin: rejected by metadata repository: {0}")]
    RejectedByMetadataRepository(#[source] RepositoryError),
    #[error("admin: rejected by storage node manager: {0}")]
    RejectedByStorageNodeManager(#[source] StorageNodeError),
    #[error("admin: invalid argument: {0}")]
    InvalidArgument(String),
    #[error("admin: storage node {0} is not registered")]
    StorageNodeNotRegistered(StorageNodeId),
    #[error("admin: log stream {log_stream_id} of topic {topic_id} not found")]
    LogStreamNotFound {
        topic_id: TopicId,
        log_stream_id: LogStreamId,
    },
    #[error("admin: trim failed on every storage node: {0}")]
    TrimFailed(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<RepositoryError> for AdminError {
    fn from(err: RepositoryError) -> Self {
        AdminError::RejectedByMetadataRepository(err)
    }
}

impl From<StorageNodeError> for AdminError {
    fn from(err: StorageNodeError) -> Self {
        AdminError::RejectedByStorageNodeManager(err)
    }
}
