//! Messages exchanged between storage nodes, the metadata repository and
//! administrative clients. Transport framing is out of scope; every message
//! is plain serde data.

pub mod log_entry;
pub mod metadata;
pub mod report;
pub mod sync;

pub use log_entry::{LogEntry, LogSequenceNumber};
pub use metadata::{
    ClusterInfo, LogStreamDescriptor, LogStreamReplicaMetadata, LogStreamStatus, Member,
    MetadataDescriptor, Replica, ReplicaDescriptor, StorageNodeDescriptor, StorageNodeMetadata,
    StorageNodeStatus, TopicDescriptor, TopicStatus,
};
pub use report::{
    GlobalCommit, LogStreamCommitResult, LogStreamUncommitReport, StorageNodeUncommitReport,
};
pub use sync::{
    SyncCommitContext, SyncPayload, SyncPosition, SyncRange, SyncState, SyncStatus,
};
