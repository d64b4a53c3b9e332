use crate::admin::AdminError;
use crate::config::ConfigError;
use crate::executor::ExecutorError;
use crate::metarepos::{MetadataError, RepositoryError};
use crate::raft::{RaftError, RaftLogError};
use crate::replication::ReplicationError;
use crate::storage::StorageError;
use crate::storagenode::StorageNodeError;
use thiserror::Error;

/// Any error the crate produces, for callers that do not care which
/// component failed.
#[derive(Debug, Error)]
pub enum ReplogError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    StorageNode(#[from] StorageNodeError),
    #[error(transparent)]
    Raft(#[from] RaftError),
    #[error(transparent)]
    RaftLog(#[from] RaftLogError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ReplogError {
    /// True when the failure says something was absent rather than broken.
    pub fn is_not_found(&self) -> bool {
        match self {
            ReplogError::Storage(err) => err.is_not_found(),
            ReplogError::Metadata(err) => err.is_not_found(),
            ReplogError::Repository(err) => err.is_not_found(),
            _ => false,
        }
    }
}
