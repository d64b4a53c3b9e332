use crate::raft::log_store::RaftEntry;
use crate::raft::membership::Membership;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub granted: bool,
    pub reject_reason: Option<RequestVoteRejectReason>,
}

impl RequestVoteResponse {
    pub fn granted(term: u64) -> Self {
        Self {
            term,
            granted: true,
            reject_reason: None,
        }
    }

    pub fn rejected(term: u64, reason: RequestVoteRejectReason) -> Self {
        Self {
            term,
            granted: false,
            reject_reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestVoteRejectReason {
    LogBehind,
    TermOutOfDate,
    AlreadyVoted,
    /// Voter still hears from a live leader.
    LeaderActive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub leader_commit: u64,
    pub entries: Vec<RaftEntry>,
}

impl AppendEntriesRequest {
    pub fn heartbeat(
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        leader_commit: u64,
    ) -> Self {
        Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            leader_commit,
            entries: Vec::new(),
        }
    }

    /// Index of the last entry carried, or the match position for heartbeats.
    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|entry| entry.index)
            .unwrap_or(self.prev_log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
    pub conflict_index: Option<u64>,
    pub conflict_term: Option<u64>,
}

/// Full state transfer for a follower whose next entry was compacted away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub membership: Membership,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub match_index: u64,
}

/// A proposal forwarded from a follower to the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub from: NodeId,
    pub entry: ProposedEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposedEntry {
    Normal { data: Vec<u8> },
    ConfChange { change: crate::raft::membership::ConfChange },
}
