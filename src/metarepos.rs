//! Metadata repository: the raft-replicated registry of storage nodes,
//! topics and log streams, and the source of global commit rounds.
//!
//! The leader pulls uncommitted reports from storage nodes, proposes them,
//! turns them into Version-tagged [`GlobalCommit`](crate::proto::GlobalCommit)
//! rounds and pushes each replica the round that follows its last reported
//! high watermark. All state changes go through the raft log and are applied
//! by [`RepositoryState`].

pub mod config;
pub mod error;
pub mod reporter;
pub mod repository;
pub mod request;
pub mod request_map;
pub mod state;

pub use config::MetadataRepositoryConfig;
pub use error::{MetadataError, RepositoryError};
pub use reporter::{ReporterClient, ReporterConnector, ReporterError, ReporterPool};
pub use repository::MetadataRepository;
pub use request::{ApplyOutput, ApplyResult, Request, RequestEnvelope};
pub use request_map::{PendingRequest, RequestMap};
pub use state::{CommitCalculation, ReplicaReports, RepositoryState};
