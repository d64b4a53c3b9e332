//! Raft consensus for the metadata repository: persistent log, elections,
//! replication, snapshots and single-step membership changes.

pub mod append;
pub mod config;
pub mod election;
pub mod engine;
pub mod error;
pub mod log_store;
pub mod membership;
pub mod node;
pub mod quorum;
pub mod rpc;
pub mod snapshot;
pub mod transport;

pub use append::{AppendEntriesOutcome, AppendEntriesProcessor};
pub use config::RaftConfig;
pub use engine::{RaftStatus, Role};
pub use election::{CandidateState, ElectionController, ElectionTimer};
pub use error::RaftError;
pub use log_store::{EntryKind, HardState, RaftEntry, RaftLogError, RaftLogStore, TermIndex};
pub use membership::{ConfChange, ConfChangeKind, Membership};
pub use node::{RaftNode, RaftStateMachine};
pub use quorum::{PartitionQuorum, PartitionQuorumStatus, QuorumError, ReplicaProgress};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    ProposeRequest, ProposedEntry, RequestVoteRejectReason, RequestVoteRequest,
    RequestVoteResponse,
};
pub use snapshot::{Snapshot, SnapshotStore};
pub use transport::{LocalRaftNetwork, RaftMessageHandler, RaftTransport};
