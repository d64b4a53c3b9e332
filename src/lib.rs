//! Replicated log with globally ordered commits.
//!
//! Storage nodes host log-stream replicas ([`executor`]) on a RocksDB engine
//! ([`storage`]) and replicate appends primary-to-backup ([`replication`]).
//! A raft-replicated metadata repository ([`metarepos`]) collects every
//! replica's uncommitted suffix and hands back version-tagged commit rounds
//! that assign GLSNs. [`admin`] drives the operator flows across both.

pub mod admin;
pub mod config;
pub mod executor;
pub mod metarepos;
pub mod proto;
pub mod raft;
pub mod replication;
pub mod storage;
pub mod storagenode;
pub mod types;
pub mod util;

pub use admin::{AdminConfig, AdminError, ClusterManager};
pub use config::{load_config, ConfigError};
pub use executor::{Executor, ExecutorConfig, ExecutorError};
pub use metarepos::{MetadataError, MetadataRepository, MetadataRepositoryConfig, RepositoryError};
pub use raft::{LocalRaftNetwork, RaftConfig, RaftError, RaftNode};
pub use replication::{LocalReplicationNetwork, ReplicationError};
pub use storage::{Storage, StorageConfig, StorageError};
pub use storagenode::{StorageNode, StorageNodeConfig, StorageNodeError, StorageNodeRegistry};
pub use types::{ClusterId, Glsn, Llsn, LogStreamId, NodeId, StorageNodeId, TopicId, Version};
pub use util::{init_logging, ReplogError, RetryPolicy};
