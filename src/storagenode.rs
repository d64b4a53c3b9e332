//! Storage node: hosts one executor per log-stream replica and exposes the
//! management surface used by the admin and the reporter surface used by the
//! metadata repository.

pub mod client;
pub mod config;
pub mod error;

pub use client::{
    LocalStorageNodeClient, StorageNodeClient, StorageNodeConnector, StorageNodeRegistry,
};
pub use config::StorageNodeConfig;
pub use error::StorageNodeError;

use crate::executor::{Executor, ExecutorConfig};
use crate::proto::{
    LogSequenceNumber, LogStreamCommitResult, LogStreamStatus, Replica, StorageNodeMetadata,
    StorageNodeUncommitReport, SyncStatus,
};
use crate::replication::{ConnectorFactory, LocalReplicationNetwork, ReplicationHandler};
use crate::storage::StorageConfig;
use crate::types::{ClusterId, Glsn, LogStreamId, StorageNodeId, TopicId};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

pub struct StorageNode {
    config: StorageNodeConfig,
    network: LocalReplicationNetwork,
    executors: RwLock<BTreeMap<LogStreamId, Arc<Executor>>>,
}

impl StorageNode {
    pub fn new(
        config: StorageNodeConfig,
        network: LocalReplicationNetwork,
    ) -> Result<Arc<Self>, StorageNodeError> {
        config.validate()?;
        for volume in &config.volumes {
            std::fs::create_dir_all(volume)?;
        }
        info!(
            "event=storage_node_start cid={} snid={} address={} volumes={}",
            config.cluster_id,
            config.storage_node_id,
            config.address,
            config.volumes.len()
        );
        Ok(Arc::new(Self {
            config,
            network,
            executors: RwLock::new(BTreeMap::new()),
        }))
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.config.cluster_id
    }

    pub fn storage_node_id(&self) -> StorageNodeId {
        self.config.storage_node_id
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn volumes(&self) -> &[PathBuf] {
        &self.config.volumes
    }

    pub fn replica(&self, topic_id: TopicId, log_stream_id: LogStreamId) -> Replica {
        Replica::new(
            self.config.storage_node_id,
            topic_id,
            log_stream_id,
            self.config.address.clone(),
        )
    }

    /// Rejects requests addressed to another cluster or node.
    pub fn check_target(
        &self,
        cluster_id: ClusterId,
        storage_node_id: StorageNodeId,
    ) -> Result<(), StorageNodeError> {
        if cluster_id != self.config.cluster_id {
            return Err(StorageNodeError::ClusterMismatch {
                expected: self.config.cluster_id,
                actual: cluster_id,
            });
        }
        if storage_node_id != self.config.storage_node_id {
            return Err(StorageNodeError::StorageNodeMismatch {
                expected: self.config.storage_node_id,
                actual: storage_node_id,
            });
        }
        Ok(())
    }

    pub fn executor(&self, log_stream_id: LogStreamId) -> Option<Arc<Executor>> {
        self.executors.read().get(&log_stream_id).cloned()
    }

    fn executor_of(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
    ) -> Result<Arc<Executor>, StorageNodeError> {
        let executor = self
            .executor(log_stream_id)
            .ok_or(StorageNodeError::LogStreamNotFound(log_stream_id))?;
        if executor.topic_id() != topic_id {
            return Err(StorageNodeError::TopicMismatch {
                topic_id,
                log_stream_id,
            });
        }
        Ok(executor)
    }

    fn volume_for(&self, requested: &str) -> Result<&Path, StorageNodeError> {
        if requested.is_empty() {
            return self
                .config
                .volumes
                .first()
                .map(PathBuf::as_path)
                .ok_or_else(|| StorageNodeError::UnknownVolume(String::new()));
        }
        self.config
            .volumes
            .iter()
            .find(|volume| volume.as_path() == Path::new(requested))
            .map(PathBuf::as_path)
            .ok_or_else(|| StorageNodeError::UnknownVolume(requested.to_string()))
    }

    /// Creates the replica directory `<volume>/<topic>_<logstream>` and opens
    /// an executor on it. Returns the replica directory.
    pub fn add_log_stream(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        volume: &str,
        replicas: Vec<Replica>,
    ) -> Result<PathBuf, StorageNodeError> {
        let mut executors = self.executors.write();
        if executors.contains_key(&log_stream_id) {
            return Err(StorageNodeError::LogStreamExists(log_stream_id));
        }
        let dir = self
            .volume_for(volume)?
            .join(format!("{topic_id}_{log_stream_id}"));
        let template = &self.config.executor;
        let config = ExecutorConfig {
            storage_node_id: self.config.storage_node_id,
            topic_id,
            log_stream_id,
            storage: StorageConfig {
                path: dir.clone(),
                ..template.storage.clone()
            },
            ..template.clone()
        };
        let connectors: Arc<dyn ConnectorFactory> = Arc::new(self.network.clone());
        let executor = Executor::open(config, replicas, connectors)?;
        let handler = Arc::downgrade(&executor) as Weak<dyn ReplicationHandler>;
        self.network
            .register(self.config.storage_node_id, log_stream_id, handler);
        executors.insert(log_stream_id, executor);
        info!(
            "event=log_stream_added snid={} tpid={topic_id} lsid={log_stream_id} path={}",
            self.config.storage_node_id,
            dir.display()
        );
        Ok(dir)
    }

    pub async fn remove_log_stream(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
    ) -> Result<(), StorageNodeError> {
        self.executor_of(topic_id, log_stream_id)?;
        let Some(executor) = self.executors.write().remove(&log_stream_id) else {
            return Err(StorageNodeError::LogStreamNotFound(log_stream_id));
        };
        self.network
            .unregister(self.config.storage_node_id, log_stream_id);
        let path = executor.storage().path().to_path_buf();
        executor.close().await;
        drop(executor);
        if let Err(err) = std::fs::remove_dir_all(&path) {
            warn!(
                "event=log_stream_remove_dir_failed lsid={log_stream_id} path={} error={err}",
                path.display()
            );
        }
        info!(
            "event=log_stream_removed snid={} lsid={log_stream_id}",
            self.config.storage_node_id
        );
        Ok(())
    }

    pub async fn append(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        batch: Vec<Vec<u8>>,
    ) -> Result<Vec<LogSequenceNumber>, StorageNodeError> {
        let executor = self.executor_of(topic_id, log_stream_id)?;
        Ok(executor.append(batch).await?)
    }

    pub async fn seal(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        last_committed_glsn: Glsn,
    ) -> Result<(LogStreamStatus, Glsn), StorageNodeError> {
        let executor = self.executor_of(topic_id, log_stream_id)?;
        Ok(executor.seal(last_committed_glsn).await?)
    }

    pub async fn unseal(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        replicas: Option<Vec<Replica>>,
    ) -> Result<(), StorageNodeError> {
        let executor = self.executor_of(topic_id, log_stream_id)?;
        Ok(executor.unseal(replicas).await?)
    }

    pub async fn sync(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        destination: Replica,
        last_glsn: Glsn,
    ) -> Result<SyncStatus, StorageNodeError> {
        let executor = self.executor_of(topic_id, log_stream_id)?;
        Ok(executor.sync(destination, last_glsn).await?)
    }

    /// Trims every replica of `topic_id`; the outcome is reported per log
    /// stream.
    pub fn trim(
        &self,
        topic_id: TopicId,
        glsn: Glsn,
    ) -> BTreeMap<LogStreamId, Result<(), String>> {
        let executors: Vec<_> = self
            .executors
            .read()
            .values()
            .filter(|executor| executor.topic_id() == topic_id)
            .cloned()
            .collect();
        executors
            .into_iter()
            .map(|executor| {
                let result = executor.trim(glsn).map_err(|err| err.to_string());
                (executor.log_stream_id(), result)
            })
            .collect()
    }

    pub fn get_metadata(&self) -> StorageNodeMetadata {
        let log_streams = self
            .executors
            .read()
            .values()
            .map(|executor| executor.metadata())
            .collect();
        StorageNodeMetadata {
            cluster_id: self.config.cluster_id,
            storage_node_id: self.config.storage_node_id,
            address: self.config.address.clone(),
            log_streams,
        }
    }

    /// Collects the uncommitted report of every hosted replica. Replicas that
    /// fail to report are skipped.
    pub fn get_report(&self) -> StorageNodeUncommitReport {
        let mut report = StorageNodeUncommitReport::new(self.config.storage_node_id);
        for executor in self.executors.read().values() {
            match executor.get_report() {
                Ok(lsr) => report.reports.push(lsr),
                Err(err) => debug!(
                    "event=report_skipped lsid={} error={err}",
                    executor.log_stream_id()
                ),
            }
        }
        report
    }

    /// Hands each commit result to its replica. Results for log streams this
    /// node does not host are ignored.
    pub async fn commit(&self, results: &[LogStreamCommitResult]) {
        for result in results {
            let Some(executor) = self.executor(result.log_stream_id) else {
                debug!(
                    "event=commit_ignored reason=unknown_log_stream snid={} lsid={}",
                    self.config.storage_node_id, result.log_stream_id
                );
                continue;
            };
            if let Err(err) = executor.commit(result).await {
                debug!(
                    "event=commit_rejected lsid={} hwm={} error={err}",
                    result.log_stream_id, result.high_watermark
                );
            }
        }
    }

    pub async fn close(&self) {
        let executors: Vec<_> = std::mem::take(&mut *self.executors.write())
            .into_values()
            .collect();
        for executor in executors {
            self.network
                .unregister(self.config.storage_node_id, executor.log_stream_id());
            executor.close().await;
        }
        info!("event=storage_node_closed snid={}", self.config.storage_node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn node(tmp: &TempDir, snid: i32, network: &LocalReplicationNetwork) -> Arc<StorageNode> {
        StorageNode::new(
            StorageNodeConfig::new(
                ClusterId(1),
                StorageNodeId(snid),
                tmp.path().join(format!("sn{snid}")),
            ),
            network.clone(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn add_log_stream_creates_named_directory() {
        let tmp = TempDir::new().unwrap();
        let network = LocalReplicationNetwork::new();
        let sn = node(&tmp, 1, &network);
        let replicas = vec![sn.replica(TopicId(3), LogStreamId(7))];
        let path = sn
            .add_log_stream(TopicId(3), LogStreamId(7), "", replicas.clone())
            .unwrap();
        assert!(path.ends_with("3_7"));
        assert!(path.is_dir());
        assert!(matches!(
            sn.add_log_stream(TopicId(3), LogStreamId(7), "", replicas),
            Err(StorageNodeError::LogStreamExists(LogStreamId(7)))
        ));
        assert!(matches!(
            sn.add_log_stream(TopicId(3), LogStreamId(8), "/nowhere", Vec::new()),
            Err(StorageNodeError::UnknownVolume(_))
        ));

        let metadata = sn.get_metadata();
        assert_eq!(metadata.log_streams.len(), 1);
        assert_eq!(metadata.log_streams[0].status, LogStreamStatus::Running);
        sn.close().await;
    }

    #[tokio::test]
    async fn report_and_commit_round_trip_through_node() {
        let tmp = TempDir::new().unwrap();
        let network = LocalReplicationNetwork::new();
        let sn = node(&tmp, 1, &network);
        let replicas = vec![sn.replica(TopicId(1), LogStreamId(1))];
        sn.add_log_stream(TopicId(1), LogStreamId(1), "", replicas)
            .unwrap();

        let append = {
            let sn = Arc::clone(&sn);
            tokio::spawn(async move {
                sn.append(TopicId(1), LogStreamId(1), vec![b"a".to_vec(), b"b".to_vec()])
                    .await
            })
        };
        let report = loop {
            let report = sn.get_report();
            if report.reports[0].uncommitted_llsn_length == 2 {
                break report;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert_eq!(report.reports[0].uncommitted_llsn_offset, crate::types::Llsn(1));

        sn.commit(&[LogStreamCommitResult {
            topic_id: TopicId(1),
            log_stream_id: LogStreamId(1),
            version: crate::types::Version(1),
            prev_high_watermark: Glsn::INVALID,
            high_watermark: Glsn(2),
            committed_llsn_offset: crate::types::Llsn(1),
            committed_glsn_offset: Glsn(1),
            committed_glsn_length: 2,
        }])
        .await;
        let positions = append.await.unwrap().unwrap();
        assert_eq!(
            positions.iter().map(|lsn| lsn.glsn).collect::<Vec<_>>(),
            vec![Glsn(1), Glsn(2)]
        );
        sn.close().await;
    }

    #[tokio::test]
    async fn check_target_rejects_foreign_ids() {
        let tmp = TempDir::new().unwrap();
        let sn = node(&tmp, 4, &LocalReplicationNetwork::new());
        assert!(sn.check_target(ClusterId(1), StorageNodeId(4)).is_ok());
        assert!(matches!(
            sn.check_target(ClusterId(2), StorageNodeId(4)),
            Err(StorageNodeError::ClusterMismatch { .. })
        ));
        assert!(matches!(
            sn.check_target(ClusterId(1), StorageNodeId(5)),
            Err(StorageNodeError::StorageNodeMismatch { .. })
        ));
    }
}
