use crate::admin::error::AdminError;
use crate::proto::{
    LogStreamDescriptor, LogStreamStatus, MetadataDescriptor, Replica, StorageNodeDescriptor,
    StorageNodeMetadata, SyncStatus,
};
use crate::storagenode::{StorageNodeClient, StorageNodeConnector, StorageNodeError};
use crate::types::{Glsn, LogStreamId, StorageNodeId, TopicId};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes management calls to storage nodes, keeping one client per node.
/// A client that fails is dropped so the next call reconnects.
pub struct StorageNodeManager {
    connector: Arc<dyn StorageNodeConnector>,
    clients: Mutex<HashMap<StorageNodeId, Arc<dyn StorageNodeClient>>>,
}

impl StorageNodeManager {
    pub fn new(connector: Arc<dyn StorageNodeConnector>) -> Self {
        Self {
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(
        &self,
        node: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn StorageNodeClient>, StorageNodeError> {
        let cached = self.clients.lock().get(&node.storage_node_id).cloned();
        if let Some(client) = cached {
            return Ok(client);
        }
        let client = self.connector.connect(node).await?;
        self.clients
            .lock()
            .insert(node.storage_node_id, Arc::clone(&client));
        Ok(client)
    }

    fn close_client(&self, storage_node_id: StorageNodeId) {
        if self.clients.lock().remove(&storage_node_id).is_some() {
            debug!("event=sn_client_closed snid={storage_node_id}");
        }
    }

    fn track<T>(
        &self,
        storage_node_id: StorageNodeId,
        result: Result<T, StorageNodeError>,
    ) -> Result<T, AdminError> {
        if let Err(StorageNodeError::Unreachable(_)) = &result {
            self.close_client(storage_node_id);
        }
        Ok(result?)
    }

    fn storage_node<'a>(
        metadata: &'a MetadataDescriptor,
        storage_node_id: StorageNodeId,
    ) -> Result<&'a StorageNodeDescriptor, AdminError> {
        metadata
            .storage_node(storage_node_id)
            .ok_or(AdminError::StorageNodeNotRegistered(storage_node_id))
    }

    /// Replication targets of `log_stream`, primary first.
    pub fn replicas_of(
        metadata: &MetadataDescriptor,
        log_stream: &LogStreamDescriptor,
    ) -> Result<Vec<Replica>, AdminError> {
        log_stream
            .replicas
            .iter()
            .map(|replica| {
                let node = Self::storage_node(metadata, replica.storage_node_id)?;
                Ok(Replica::new(
                    replica.storage_node_id,
                    log_stream.topic_id,
                    log_stream.log_stream_id,
                    node.address.clone(),
                ))
            })
            .collect()
    }

    pub async fn get_metadata(
        &self,
        node: &StorageNodeDescriptor,
    ) -> Result<StorageNodeMetadata, AdminError> {
        let result = async { self.client(node).await?.get_metadata().await }.await;
        self.track(node.storage_node_id, result)
    }

    /// Creates the log stream on every replica. On failure the replicas
    /// already created are removed again and the first error is returned.
    pub async fn add_log_stream(
        &self,
        metadata: &MetadataDescriptor,
        log_stream: &LogStreamDescriptor,
    ) -> Result<LogStreamDescriptor, AdminError> {
        let replicas = Self::replicas_of(metadata, log_stream)?;
        let mut created = Vec::with_capacity(log_stream.replicas.len());
        let mut placed = log_stream.clone();
        for replica in placed.replicas.iter_mut() {
            let node = Self::storage_node(metadata, replica.storage_node_id)?.clone();
            let result = async {
                self.client(&node)
                    .await?
                    .add_log_stream(
                        log_stream.topic_id,
                        log_stream.log_stream_id,
                        &replica.path,
                        replicas.clone(),
                    )
                    .await
            }
            .await;
            match self.track(node.storage_node_id, result) {
                Ok(path) => {
                    replica.path = path.to_string_lossy().into_owned();
                    created.push(node);
                }
                Err(err) => {
                    warn!(
                        "event=add_log_stream_failed snid={} lsid={} error={err}",
                        node.storage_node_id, log_stream.log_stream_id
                    );
                    self.remove_from(&created, log_stream).await;
                    return Err(err);
                }
            }
        }
        info!(
            "event=log_stream_created tpid={} lsid={} replicas={}",
            log_stream.topic_id,
            log_stream.log_stream_id,
            created.len()
        );
        Ok(placed)
    }

    /// Best-effort removal of the log stream from every replica.
    pub async fn remove_log_stream(
        &self,
        metadata: &MetadataDescriptor,
        log_stream: &LogStreamDescriptor,
    ) {
        let nodes: Vec<_> = log_stream
            .replicas
            .iter()
            .filter_map(|replica| metadata.storage_node(replica.storage_node_id).cloned())
            .collect();
        self.remove_from(&nodes, log_stream).await;
    }

    async fn remove_from(
        &self,
        nodes: &[StorageNodeDescriptor],
        log_stream: &LogStreamDescriptor,
    ) {
        for node in nodes {
            let result = async {
                self.client(node)
                    .await?
                    .remove_log_stream(log_stream.topic_id, log_stream.log_stream_id)
                    .await
            }
            .await;
            if let Err(err) = self.track(node.storage_node_id, result) {
                warn!(
                    "event=log_stream_remove_failed snid={} lsid={} error={err}",
                    node.storage_node_id, log_stream.log_stream_id
                );
            }
        }
    }

    /// Seals every replica at `last_committed_glsn`. Returns each replica's
    /// resulting status.
    pub async fn seal(
        &self,
        metadata: &MetadataDescriptor,
        log_stream: &LogStreamDescriptor,
        last_committed_glsn: Glsn,
    ) -> Result<Vec<(StorageNodeId, LogStreamStatus)>, AdminError> {
        let mut statuses = Vec::with_capacity(log_stream.replicas.len());
        for replica in &log_stream.replicas {
            let node = Self::storage_node(metadata, replica.storage_node_id)?;
            let result = async {
                self.client(node)
                    .await?
                    .seal(
                        log_stream.topic_id,
                        log_stream.log_stream_id,
                        last_committed_glsn,
                    )
                    .await
            }
            .await;
            let (status, _) = self.track(node.storage_node_id, result)?;
            statuses.push((node.storage_node_id, status));
        }
        Ok(statuses)
    }

    pub async fn unseal(
        &self,
        metadata: &MetadataDescriptor,
        log_stream: &LogStreamDescriptor,
    ) -> Result<(), AdminError> {
        let replicas = Self::replicas_of(metadata, log_stream)?;
        for replica in &log_stream.replicas {
            let node = Self::storage_node(metadata, replica.storage_node_id)?;
            let result = async {
                self.client(node)
                    .await?
                    .unseal(
                        log_stream.topic_id,
                        log_stream.log_stream_id,
                        Some(replicas.clone()),
                    )
                    .await
            }
            .await;
            self.track(node.storage_node_id, result)?;
        }
        Ok(())
    }

    pub async fn sync(
        &self,
        source: &StorageNodeDescriptor,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        destination: Replica,
        last_glsn: Glsn,
    ) -> Result<SyncStatus, AdminError> {
        let result = async {
            self.client(source)
                .await?
                .sync(topic_id, log_stream_id, destination, last_glsn)
                .await
        }
        .await;
        self.track(source.storage_node_id, result)
    }

    /// Trims the topic on every node. The per-node outcome is returned, with
    /// a node's failure flattened into a message.
    pub async fn trim(
        &self,
        metadata: &MetadataDescriptor,
        topic_id: TopicId,
        glsn: Glsn,
    ) -> Vec<(StorageNodeId, Result<(), String>)> {
        let mut outcomes = Vec::with_capacity(metadata.storage_nodes.len());
        for node in metadata.storage_nodes.values() {
            let hosts_topic = metadata
                .log_streams_on(node.storage_node_id)
                .any(|ls| ls.topic_id == topic_id);
            if !hosts_topic {
                continue;
            }
            let result = async { self.client(node).await?.trim(topic_id, glsn).await }.await;
            let outcome = match self.track(node.storage_node_id, result) {
                Ok(per_log_stream) => per_log_stream
                    .into_iter()
                    .find_map(|(lsid, result)| result.err().map(|err| format!("{lsid}: {err}")))
                    .map_or(Ok(()), Err),
                Err(err) => Err(err.to_string()),
            };
            outcomes.push((node.storage_node_id, outcome));
        }
        outcomes
    }
}
