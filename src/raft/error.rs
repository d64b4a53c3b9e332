use crate::config::ConfigError;
use crate::raft::log_store::RaftLogError;
use crate::types::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("raft: not leader (leader {leader:?})")]
    NotLeader { leader: Option<NodeId> },
    #[error("raft: member {0} unreachable")]
    Unreachable(NodeId),
    #[error("raft: a membership change is already pending")]
    ConfChangeInProgress,
    #[error("raft: node stopped")]
    Stopped,
    #[error("raft: state machine: {0}")]
    StateMachine(String),
    #[error(transparent)]
    Log(#[from] RaftLogError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("raft: codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl RaftError {
    /// Errors a proposer may retry after a short delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RaftError::NotLeader { .. } | RaftError::Unreachable(_))
    }
}
