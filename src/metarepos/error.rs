use crate::config::ConfigError;
use crate::metarepos::reporter::ReporterError;
use crate::raft::RaftError;
use thiserror::Error;

/// Rejection produced by the replicated state machine. Every member computes
/// the same one for the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum MetadataError {
    #[error("metadata: {0} not found")]
    NotFound(String),
    #[error("metadata: {0} already exists")]
    AlreadyExists(String),
    #[error("metadata: invalid argument: {0}")]
    InvalidArgument(String),
    #[error("metadata: failed precondition: {0}")]
    FailedPrecondition(String),
}

impl MetadataError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Raft(#[from] RaftError),
    /// The deadline passed before the proposal was seen applied. The change
    /// may still land.
    #[error("metadata repository: proposal timed out")]
    Timeout,
    #[error("metadata repository: stopped")]
    Stopped,
    #[error(transparent)]
    Reporter(#[from] ReporterError),
    #[error("metadata repository: codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::Metadata(err) if err.is_not_found())
    }

    /// Failures of the member or its link rather than rejections; another
    /// attempt, possibly through another member, may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RepositoryError::Stopped => true,
            RepositoryError::Raft(err) => err.is_retryable() || matches!(err, RaftError::Stopped),
            _ => false,
        }
    }
}
