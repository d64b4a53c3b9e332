//! Administrative flows over the metadata repository and storage nodes.
//!
//! [`ClusterManager`] runs the multi-step operations: add a log stream,
//! seal, unseal, sync and trim. Each step talks to one component, and a
//! failing step stops the flow with an error naming that component.

pub mod cache;
pub mod config;
pub mod error;
pub mod mr_manager;
pub mod sn_manager;

pub use cache::{ClusterMetadataCache, DEFAULT_RELOAD_INTERVAL};
pub use config::AdminConfig;
pub use error::AdminError;
pub use mr_manager::{LocalMrConnector, MetadataRepositoryManager, MrClient, MrConnector};
pub use sn_manager::StorageNodeManager;

use crate::proto::{
    ClusterInfo, LogStreamDescriptor, LogStreamStatus, MetadataDescriptor, Replica,
    ReplicaDescriptor, StorageNodeDescriptor, SyncStatus,
};
use crate::storagenode::StorageNodeConnector;
use crate::types::{Glsn, LogStreamId, NodeId, StorageNodeId, TopicId};
use crate::util::RetryPolicy;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Admin-side view of each log stream's status while flows run on it.
#[derive(Debug, Default)]
pub struct LogStreamStats {
    statuses: Mutex<HashMap<LogStreamId, LogStreamStatus>>,
}

impl LogStreamStats {
    pub fn get(&self, log_stream_id: LogStreamId) -> Option<LogStreamStatus> {
        self.statuses.lock().get(&log_stream_id).copied()
    }

    pub fn set(&self, log_stream_id: LogStreamId, status: LogStreamStatus) {
        self.statuses.lock().insert(log_stream_id, status);
    }

    pub fn remove(&self, log_stream_id: LogStreamId) {
        self.statuses.lock().remove(&log_stream_id);
    }

    /// Fills in statuses for log streams first seen in `metadata`.
    fn observe(&self, metadata: &MetadataDescriptor) {
        let mut statuses = self.statuses.lock();
        for (lsid, ls) in &metadata.log_streams {
            statuses.entry(*lsid).or_insert(ls.status);
        }
    }
}

/// Result of sealing a log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealOutcome {
    pub last_committed_glsn: Glsn,
    pub replicas: Vec<(StorageNodeId, LogStreamStatus)>,
}

impl SealOutcome {
    /// Every replica reached the last committed position.
    pub fn is_complete(&self) -> bool {
        self.replicas
            .iter()
            .all(|(_, status)| *status == LogStreamStatus::Sealed)
    }
}

pub struct ClusterManager {
    config: AdminConfig,
    mr: MetadataRepositoryManager,
    sn: StorageNodeManager,
    stats: LogStreamStats,
    /// Serializes the mutating flows.
    flow: tokio::sync::Mutex<()>,
}

impl ClusterManager {
    pub fn new(
        config: AdminConfig,
        mr_connector: Arc<dyn MrConnector>,
        sn_connector: Arc<dyn StorageNodeConnector>,
    ) -> Result<Self, AdminError> {
        config.validate()?;
        let retry = RetryPolicy::exponential(config.mr_call_attempts, config.mr_call_backoff)
            .with_max_delay(config.mr_call_backoff * 10);
        let mr = MetadataRepositoryManager::new(mr_connector, config.metadata_reload_interval)
            .with_retry(retry);
        Ok(Self {
            config,
            mr,
            sn: StorageNodeManager::new(sn_connector),
            stats: LogStreamStats::default(),
            flow: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    pub fn metadata_repository(&self) -> &MetadataRepositoryManager {
        &self.mr
    }

    pub fn storage_nodes(&self) -> &StorageNodeManager {
        &self.sn
    }

    pub fn log_stream_status(&self, log_stream_id: LogStreamId) -> Option<LogStreamStatus> {
        self.stats.get(log_stream_id)
    }

    pub async fn metadata(&self) -> Result<Arc<MetadataDescriptor>, AdminError> {
        let metadata = self.mr.cluster_metadata().await?;
        self.stats.observe(&metadata);
        Ok(metadata)
    }

    pub async fn cluster_info(&self) -> Result<ClusterInfo, AdminError> {
        self.mr.get_cluster_info().await
    }

    fn log_stream_of(
        metadata: &MetadataDescriptor,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
    ) -> Result<LogStreamDescriptor, AdminError> {
        metadata
            .log_stream(log_stream_id)
            .filter(|ls| ls.topic_id == topic_id)
            .cloned()
            .ok_or(AdminError::LogStreamNotFound {
                topic_id,
                log_stream_id,
            })
    }

    /// Registers a storage node after checking it answers as `storage_node_id`.
    pub async fn add_storage_node(
        &self,
        storage_node: StorageNodeDescriptor,
    ) -> Result<(), AdminError> {
        let _flow = self.flow.lock().await;
        let reported = self.sn.get_metadata(&storage_node).await?;
        if reported.storage_node_id != storage_node.storage_node_id {
            return Err(AdminError::InvalidArgument(format!(
                "storage node at {} answers as {}",
                storage_node.address, reported.storage_node_id
            )));
        }
        let storage_node_id = storage_node.storage_node_id;
        self.mr.register_storage_node(storage_node).await?;
        info!("event=storage_node_registered snid={storage_node_id}");
        Ok(())
    }

    pub async fn unregister_storage_node(
        &self,
        storage_node_id: StorageNodeId,
    ) -> Result<(), AdminError> {
        let _flow = self.flow.lock().await;
        self.mr.unregister_storage_node(storage_node_id).await
    }

    pub async fn add_topic(&self, topic_id: TopicId) -> Result<(), AdminError> {
        let _flow = self.flow.lock().await;
        self.mr.register_topic(topic_id).await
    }

    pub async fn unregister_topic(&self, topic_id: TopicId) -> Result<(), AdminError> {
        let _flow = self.flow.lock().await;
        self.mr.unregister_topic(topic_id).await
    }

    /// Creates the log stream on the chosen storage nodes, then registers it
    /// with the metadata repository. The first replica is the primary. A
    /// failed registration removes the replicas again.
    pub async fn add_log_stream(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        replicas: Vec<ReplicaDescriptor>,
    ) -> Result<LogStreamDescriptor, AdminError> {
        let _flow = self.flow.lock().await;
        if replicas.len() != self.config.replication_factor {
            return Err(AdminError::InvalidArgument(format!(
                "log stream needs {} replicas, got {}",
                self.config.replication_factor,
                replicas.len()
            )));
        }
        let distinct: BTreeSet<_> = replicas.iter().map(|r| r.storage_node_id).collect();
        if distinct.len() != replicas.len() {
            return Err(AdminError::InvalidArgument(
                "replicas must be on distinct storage nodes".into(),
            ));
        }
        let metadata = self.metadata().await?;
        if metadata.topic(topic_id).is_none() {
            return Err(AdminError::InvalidArgument(format!(
                "topic {topic_id} is not registered"
            )));
        }
        if metadata.log_stream(log_stream_id).is_some() {
            return Err(AdminError::InvalidArgument(format!(
                "log stream {log_stream_id} already exists"
            )));
        }
        if let Some(missing) = distinct
            .iter()
            .find(|snid| metadata.storage_node(**snid).is_none())
        {
            return Err(AdminError::StorageNodeNotRegistered(*missing));
        }

        let requested = LogStreamDescriptor::new(topic_id, log_stream_id, replicas);
        let placed = self.sn.add_log_stream(&metadata, &requested).await?;
        if let Err(err) = self.mr.register_log_stream(placed.clone()).await {
            warn!("event=log_stream_register_failed tpid={topic_id} lsid={log_stream_id} error={err}");
            self.sn.remove_log_stream(&metadata, &placed).await;
            return Err(err);
        }
        self.stats.set(log_stream_id, LogStreamStatus::Running);
        info!("event=log_stream_registered tpid={topic_id} lsid={log_stream_id}");
        Ok(placed)
    }

    /// Unregisters the log stream, then removes its replicas.
    pub async fn unregister_log_stream(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
    ) -> Result<(), AdminError> {
        let _flow = self.flow.lock().await;
        let metadata = self.metadata().await?;
        let log_stream = Self::log_stream_of(&metadata, topic_id, log_stream_id)?;
        self.mr.unregister_log_stream(log_stream_id).await?;
        self.sn.remove_log_stream(&metadata, &log_stream).await;
        self.stats.remove(log_stream_id);
        Ok(())
    }

    pub async fn seal(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
    ) -> Result<SealOutcome, AdminError> {
        let _flow = self.flow.lock().await;
        let metadata = self.metadata().await?;
        let log_stream = Self::log_stream_of(&metadata, topic_id, log_stream_id)?;
        self.stats.set(log_stream_id, LogStreamStatus::Sealing);
        let result = async {
            let last_committed_glsn = self.mr.seal(log_stream_id).await?;
            let replicas = self
                .sn
                .seal(&metadata, &log_stream, last_committed_glsn)
                .await?;
            Ok(SealOutcome {
                last_committed_glsn,
                replicas,
            })
        }
        .await;
        match &result {
            Ok(outcome) => {
                if outcome.is_complete() {
                    self.stats.set(log_stream_id, LogStreamStatus::Sealed);
                }
                info!(
                    "event=log_stream_sealed tpid={topic_id} lsid={log_stream_id} last_committed={} complete={}",
                    outcome.last_committed_glsn,
                    outcome.is_complete()
                );
            }
            Err(err) => {
                warn!("event=log_stream_seal_failed tpid={topic_id} lsid={log_stream_id} error={err}");
                self.stats.set(log_stream_id, LogStreamStatus::Running);
            }
        }
        result
    }

    pub async fn unseal(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
    ) -> Result<(), AdminError> {
        let _flow = self.flow.lock().await;
        let metadata = self.metadata().await?;
        let log_stream = Self::log_stream_of(&metadata, topic_id, log_stream_id)?;
        self.stats.set(log_stream_id, LogStreamStatus::Unsealing);
        let result = async {
            self.sn.unseal(&metadata, &log_stream).await?;
            self.mr.unseal(log_stream_id).await
        }
        .await;
        self.stats.set(log_stream_id, LogStreamStatus::Running);
        match &result {
            Ok(()) => info!("event=log_stream_unsealed tpid={topic_id} lsid={log_stream_id}"),
            Err(err) => {
                warn!("event=log_stream_unseal_failed tpid={topic_id} lsid={log_stream_id} error={err}")
            }
        }
        result
    }

    /// Copies the committed prefix of `source`'s replica onto `destination`.
    /// The log stream is sealed through the metadata repository first so the
    /// copy has a fixed end.
    pub async fn sync(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        source: StorageNodeId,
        destination: StorageNodeId,
    ) -> Result<SyncStatus, AdminError> {
        let _flow = self.flow.lock().await;
        if source == destination {
            return Err(AdminError::InvalidArgument(
                "sync source and destination are the same storage node".into(),
            ));
        }
        let metadata = self.metadata().await?;
        let log_stream = Self::log_stream_of(&metadata, topic_id, log_stream_id)?;
        if !log_stream.is_replica(source) {
            return Err(AdminError::InvalidArgument(format!(
                "storage node {source} holds no replica of log stream {log_stream_id}"
            )));
        }
        let source_node = metadata
            .storage_node(source)
            .ok_or(AdminError::StorageNodeNotRegistered(source))?;
        let destination_node = metadata
            .storage_node(destination)
            .ok_or(AdminError::StorageNodeNotRegistered(destination))?;
        let last_glsn = self.mr.seal(log_stream_id).await?;
        let target = Replica::new(
            destination,
            topic_id,
            log_stream_id,
            destination_node.address.clone(),
        );
        let status = self
            .sn
            .sync(source_node, topic_id, log_stream_id, target, last_glsn)
            .await?;
        info!(
            "event=log_stream_sync tpid={topic_id} lsid={log_stream_id} src={source} dst={destination} last_glsn={last_glsn} state={:?}",
            status.state
        );
        Ok(status)
    }

    /// Trims `topic_id` up to `glsn` on every storage node hosting it.
    /// Succeeds when at least one node trimmed.
    pub async fn trim(
        &self,
        topic_id: TopicId,
        glsn: Glsn,
    ) -> Result<Vec<(StorageNodeId, Result<(), String>)>, AdminError> {
        let _flow = self.flow.lock().await;
        let metadata = self.metadata().await?;
        let outcomes = self.sn.trim(&metadata, topic_id, glsn).await;
        if outcomes.iter().any(|(_, outcome)| outcome.is_ok()) {
            return Ok(outcomes);
        }
        let reasons = outcomes
            .iter()
            .filter_map(|(snid, outcome)| outcome.as_ref().err().map(|err| format!("{snid}: {err}")))
            .collect::<Vec<_>>();
        if reasons.is_empty() {
            return Err(AdminError::TrimFailed(format!(
                "no storage node hosts topic {topic_id}"
            )));
        }
        Err(AdminError::TrimFailed(reasons.join("; ")))
    }

    pub async fn add_mr_peer(
        &self,
        node_id: NodeId,
        url: impl Into<String>,
        learner: bool,
    ) -> Result<(), AdminError> {
        let _flow = self.flow.lock().await;
        self.mr.add_peer(node_id, url, learner).await
    }

    pub async fn remove_mr_peer(&self, node_id: NodeId) -> Result<(), AdminError> {
        let _flow = self.flow.lock().await;
        self.mr.remove_peer(node_id).await
    }

    pub fn close(&self) {
        self.mr.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_keep_flow_statuses_over_observed_ones() {
        let stats = LogStreamStats::default();
        let mut metadata = MetadataDescriptor::default();
        for id in [1, 2] {
            let lsid = LogStreamId::new(id);
            metadata
                .log_streams
                .insert(lsid, LogStreamDescriptor::new(TopicId::new(1), lsid, Vec::new()));
        }
        stats.set(LogStreamId::new(1), LogStreamStatus::Sealing);
        stats.observe(&metadata);
        assert_eq!(stats.get(LogStreamId::new(1)), Some(LogStreamStatus::Sealing));
        assert_eq!(stats.get(LogStreamId::new(2)), Some(LogStreamStatus::Running));
        stats.remove(LogStreamId::new(2));
        assert_eq!(stats.get(LogStreamId::new(2)), None);
    }

    #[test]
    fn seal_outcome_is_complete_only_when_every_replica_sealed() {
        let mut outcome = SealOutcome {
            last_committed_glsn: Glsn::new(10),
            replicas: vec![
                (StorageNodeId::new(1), LogStreamStatus::Sealed),
                (StorageNodeId::new(2), LogStreamStatus::Sealing),
            ],
        };
        assert!(!outcome.is_complete());
        outcome.replicas[1].1 = LogStreamStatus::Sealed;
        assert!(outcome.is_complete());
    }
}
