use crate::proto::log_entry::LogSequenceNumber;
use crate::types::{ClusterId, Glsn, Llsn, LogStreamId, NodeId, StorageNodeId, TopicId, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStreamStatus {
    #[default]
    Running,
    Sealing,
    Sealed,
    Unsealing,
    /// Replica is receiving a bulk sync and cannot serve appends.
    Learning,
    Deleted,
}

impl LogStreamStatus {
    pub fn is_sealed(self) -> bool {
        matches!(self, LogStreamStatus::Sealed)
    }

    pub fn is_sealing_or_sealed(self) -> bool {
        matches!(self, LogStreamStatus::Sealing | LogStreamStatus::Sealed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogStreamStatus::Running => "running",
            LogStreamStatus::Sealing => "sealing",
            LogStreamStatus::Sealed => "sealed",
            LogStreamStatus::Unsealing => "unsealing",
            LogStreamStatus::Learning => "learning",
            LogStreamStatus::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageNodeStatus {
    #[default]
    Running,
    Deleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    #[default]
    Running,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeDescriptor {
    pub storage_node_id: StorageNodeId,
    pub address: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub status: StorageNodeStatus,
}

impl StorageNodeDescriptor {
    pub fn new(storage_node_id: StorageNodeId, address: impl Into<String>) -> Self {
        Self {
            storage_node_id,
            address: address.into(),
            paths: Vec::new(),
            status: StorageNodeStatus::Running,
        }
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDescriptor {
    pub topic_id: TopicId,
    #[serde(default)]
    pub status: TopicStatus,
    #[serde(default)]
    pub log_streams: Vec<LogStreamId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub storage_node_id: StorageNodeId,
    #[serde(default)]
    pub path: String,
}

impl ReplicaDescriptor {
    pub fn new(storage_node_id: StorageNodeId, path: impl Into<String>) -> Self {
        Self {
            storage_node_id,
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamDescriptor {
    pub topic_id: TopicId,
    pub log_stream_id: LogStreamId,
    #[serde(default)]
    pub status: LogStreamStatus,
    pub replicas: Vec<ReplicaDescriptor>,
}

impl LogStreamDescriptor {
    pub fn new(
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        replicas: Vec<ReplicaDescriptor>,
    ) -> Self {
        Self {
            topic_id,
            log_stream_id,
            status: LogStreamStatus::Running,
            replicas,
        }
    }

    pub fn is_replica(&self, storage_node_id: StorageNodeId) -> bool {
        self.replicas
            .iter()
            .any(|replica| replica.storage_node_id == storage_node_id)
    }
}

/// Committed cluster metadata owned by the metadata repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDescriptor {
    pub storage_nodes: BTreeMap<StorageNodeId, StorageNodeDescriptor>,
    pub topics: BTreeMap<TopicId, TopicDescriptor>,
    pub log_streams: BTreeMap<LogStreamId, LogStreamDescriptor>,
}

impl MetadataDescriptor {
    pub fn storage_node(&self, id: StorageNodeId) -> Option<&StorageNodeDescriptor> {
        self.storage_nodes.get(&id)
    }

    pub fn topic(&self, id: TopicId) -> Option<&TopicDescriptor> {
        self.topics.get(&id)
    }

    pub fn log_stream(&self, id: LogStreamId) -> Option<&LogStreamDescriptor> {
        self.log_streams.get(&id)
    }

    pub fn log_streams_of_topic(&self, topic_id: TopicId) -> impl Iterator<Item = &LogStreamDescriptor> {
        self.log_streams
            .values()
            .filter(move |ls| ls.topic_id == topic_id)
    }

    /// Log streams that place a replica on `storage_node_id`.
    pub fn log_streams_on(
        &self,
        storage_node_id: StorageNodeId,
    ) -> impl Iterator<Item = &LogStreamDescriptor> {
        self.log_streams
            .values()
            .filter(move |ls| ls.is_replica(storage_node_id))
    }
}

/// Replication target: one replica of a log stream hosted on a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Replica {
    pub storage_node_id: StorageNodeId,
    pub topic_id: TopicId,
    pub log_stream_id: LogStreamId,
    pub address: String,
}

impl Replica {
    pub fn new(
        storage_node_id: StorageNodeId,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        address: impl Into<String>,
    ) -> Self {
        Self {
            storage_node_id,
            topic_id,
            log_stream_id,
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub node_id: NodeId,
    pub peer_url: String,
    #[serde(default)]
    pub learner: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
    pub leader: Option<NodeId>,
    pub replication_factor: usize,
    pub members: BTreeMap<NodeId, Member>,
    pub applied_index: u64,
    pub version: Version,
    pub high_watermark: Glsn,
}

/// Per-replica state exposed by a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamReplicaMetadata {
    pub storage_node_id: StorageNodeId,
    pub topic_id: TopicId,
    pub log_stream_id: LogStreamId,
    pub status: LogStreamStatus,
    pub version: Version,
    pub high_watermark: Glsn,
    pub local_low_watermark: LogSequenceNumber,
    pub local_high_watermark: LogSequenceNumber,
    pub uncommitted_llsn_begin: Llsn,
    pub uncommitted_llsn_end: Llsn,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeMetadata {
    pub cluster_id: ClusterId,
    pub storage_node_id: StorageNodeId,
    pub address: String,
    pub log_streams: Vec<LogStreamReplicaMetadata>,
}
