use crate::config::ConfigError;
use crate::proto::LogStreamStatus;
use crate::replication::ReplicationError;
use crate::storage::StorageError;
use crate::types::{Glsn, Llsn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor: closed")]
    Closed,
    #[error("executor: {op} not allowed while {status}")]
    InvalidStatus {
        op: &'static str,
        status: &'static str,
    },
    #[error("executor: not the primary replica")]
    NotPrimary,
    #[error("executor: too old commit result (commit hwm {commit}, local hwm {local})")]
    TooOldCommitResult { commit: Glsn, local: Glsn },
    #[error("executor: replicate gap (expected llsn {expected}, got {actual})")]
    ReplicateGap { expected: Llsn, actual: Llsn },
    #[error("executor: local last committed glsn {local} is beyond seal target {target}")]
    SealTargetBehind { local: Glsn, target: Glsn },
    #[error("executor: append aborted before commit")]
    AppendAborted,
    #[error("executor: committer stopped")]
    CommitterStopped,
    #[error("executor: invalid sync: {0}")]
    InvalidSync(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ExecutorError {
    pub(crate) fn invalid_status(op: &'static str, status: LogStreamStatus) -> Self {
        ExecutorError::InvalidStatus {
            op,
            status: status.as_str(),
        }
    }
}
