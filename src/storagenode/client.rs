use super::{StorageNode, StorageNodeError};
use crate::metarepos::reporter::{ReporterClient, ReporterConnector, ReporterError};
use crate::proto::{
    LogStreamCommitResult, LogStreamStatus, Replica, StorageNodeDescriptor, StorageNodeMetadata,
    StorageNodeUncommitReport, SyncStatus,
};
use crate::types::{ClusterId, Glsn, LogStreamId, StorageNodeId, TopicId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Management calls the admin issues against one storage node.
#[async_trait]
pub trait StorageNodeClient: Send + Sync {
    fn storage_node_id(&self) -> StorageNodeId;

    async fn get_metadata(&self) -> Result<StorageNodeMetadata, StorageNodeError>;

    async fn add_log_stream(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        volume: &str,
        replicas: Vec<Replica>,
    ) -> Result<PathBuf, StorageNodeError>;

    async fn remove_log_stream(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
    ) -> Result<(), StorageNodeError>;

    async fn seal(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        last_committed_glsn: Glsn,
    ) -> Result<(LogStreamStatus, Glsn), StorageNodeError>;

    async fn unseal(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        replicas: Option<Vec<Replica>>,
    ) -> Result<(), StorageNodeError>;

    async fn sync(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        destination: Replica,
        last_glsn: Glsn,
    ) -> Result<SyncStatus, StorageNodeError>;

    async fn trim(
        &self,
        topic_id: TopicId,
        glsn: Glsn,
    ) -> Result<BTreeMap<LogStreamId, Result<(), String>>, StorageNodeError>;
}

#[async_trait]
pub trait StorageNodeConnector: Send + Sync {
    async fn connect(
        &self,
        node: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn StorageNodeClient>, StorageNodeError>;
}

/// In-process directory of storage nodes. Serves both the admin's management
/// connections and the metadata repository's reporter connections.
#[derive(Clone)]
pub struct StorageNodeRegistry {
    cluster_id: ClusterId,
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    nodes: RwLock<HashMap<StorageNodeId, Arc<StorageNode>>>,
    isolated: RwLock<HashSet<StorageNodeId>>,
}

impl StorageNodeRegistry {
    pub fn new(cluster_id: ClusterId) -> Self {
        Self {
            cluster_id,
            inner: Arc::new(RegistryInner::default()),
        }
    }

    pub fn insert(&self, node: Arc<StorageNode>) {
        self.inner.nodes.write().insert(node.storage_node_id(), node);
    }

    pub fn remove(&self, storage_node_id: StorageNodeId) -> Option<Arc<StorageNode>> {
        self.inner.nodes.write().remove(&storage_node_id)
    }

    pub fn get(&self, storage_node_id: StorageNodeId) -> Option<Arc<StorageNode>> {
        self.inner.nodes.read().get(&storage_node_id).cloned()
    }

    pub fn isolate(&self, storage_node_id: StorageNodeId) {
        self.inner.isolated.write().insert(storage_node_id);
    }

    pub fn heal(&self, storage_node_id: StorageNodeId) {
        self.inner.isolated.write().remove(&storage_node_id);
    }

    fn client(&self, storage_node_id: StorageNodeId) -> Result<LocalStorageNodeClient, StorageNodeError> {
        if self.inner.isolated.read().contains(&storage_node_id) {
            return Err(StorageNodeError::Unreachable(storage_node_id));
        }
        let node = self
            .get(storage_node_id)
            .ok_or(StorageNodeError::Unreachable(storage_node_id))?;
        Ok(LocalStorageNodeClient {
            node,
            registry: self.clone(),
            cluster_id: self.cluster_id,
            storage_node_id,
        })
    }
}

#[async_trait]
impl StorageNodeConnector for StorageNodeRegistry {
    async fn connect(
        &self,
        node: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn StorageNodeClient>, StorageNodeError> {
        Ok(Arc::new(self.client(node.storage_node_id)?))
    }
}

#[async_trait]
impl ReporterConnector for StorageNodeRegistry {
    async fn connect(
        &self,
        node: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn ReporterClient>, ReporterError> {
        let client = self
            .client(node.storage_node_id)
            .map_err(|err| ReporterError::Unreachable(node.storage_node_id, err.to_string()))?;
        Ok(Arc::new(client))
    }
}

/// A connection to a storage node living in this process. Every call checks
/// that the node is still reachable and is the one the caller expects.
pub struct LocalStorageNodeClient {
    node: Arc<StorageNode>,
    registry: StorageNodeRegistry,
    cluster_id: ClusterId,
    storage_node_id: StorageNodeId,
}

impl LocalStorageNodeClient {
    fn node(&self) -> Result<&StorageNode, StorageNodeError> {
        if self.registry.inner.isolated.read().contains(&self.storage_node_id) {
            return Err(StorageNodeError::Unreachable(self.storage_node_id));
        }
        self.node.check_target(self.cluster_id, self.storage_node_id)?;
        Ok(&self.node)
    }
}

#[async_trait]
impl StorageNodeClient for LocalStorageNodeClient {
    fn storage_node_id(&self) -> StorageNodeId {
        self.storage_node_id
    }

    async fn get_metadata(&self) -> Result<StorageNodeMetadata, StorageNodeError> {
        Ok(self.node()?.get_metadata())
    }

    async fn add_log_stream(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        volume: &str,
        replicas: Vec<Replica>,
    ) -> Result<PathBuf, StorageNodeError> {
        self.node()?
            .add_log_stream(topic_id, log_stream_id, volume, replicas)
    }

    async fn remove_log_stream(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
    ) -> Result<(), StorageNodeError> {
        self.node()?
            .remove_log_stream(topic_id, log_stream_id)
            .await
    }

    async fn seal(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        last_committed_glsn: Glsn,
    ) -> Result<(LogStreamStatus, Glsn), StorageNodeError> {
        self.node()?
            .seal(topic_id, log_stream_id, last_committed_glsn)
            .await
    }

    async fn unseal(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        replicas: Option<Vec<Replica>>,
    ) -> Result<(), StorageNodeError> {
        self.node()?
            .unseal(topic_id, log_stream_id, replicas)
            .await
    }

    async fn sync(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        destination: Replica,
        last_glsn: Glsn,
    ) -> Result<SyncStatus, StorageNodeError> {
        self.node()?
            .sync(topic_id, log_stream_id, destination, last_glsn)
            .await
    }

    async fn trim(
        &self,
        topic_id: TopicId,
        glsn: Glsn,
    ) -> Result<BTreeMap<LogStreamId, Result<(), String>>, StorageNodeError> {
        Ok(self.node()?.trim(topic_id, glsn))
    }
}

#[async_trait]
impl ReporterClient for LocalStorageNodeClient {
    fn storage_node_id(&self) -> StorageNodeId {
        self.storage_node_id
    }

    async fn get_report(&self) -> Result<StorageNodeUncommitReport, ReporterError> {
        let node = self
            .node()
            .map_err(|err| ReporterError::Unreachable(self.storage_node_id, err.to_string()))?;
        Ok(node.get_report())
    }

    async fn commit(&self, results: Vec<LogStreamCommitResult>) -> Result<(), ReporterError> {
        let node = self
            .node()
            .map_err(|err| ReporterError::Unreachable(self.storage_node_id, err.to_string()))?;
        node.commit(&results).await;
        Ok(())
    }
}
