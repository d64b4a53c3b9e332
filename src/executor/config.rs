use crate::config::ConfigError;
use crate::storage::StorageConfig;
use crate::types::{LogStreamId, StorageNodeId, TopicId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_COMMIT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_REPLICATE_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_SYNC_BATCH_SIZE: usize = 256;
pub const DEFAULT_SEAL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for one log-stream replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub storage_node_id: StorageNodeId,
    pub topic_id: TopicId,
    pub log_stream_id: LogStreamId,
    pub storage: StorageConfig,
    pub commit_queue_capacity: usize,
    pub replicate_queue_capacity: usize,
    /// Entries shipped per chunk while syncing a lagging replica.
    pub sync_batch_size: usize,
    #[serde(rename = "seal_drain_timeout_ms", with = "crate::config::duration_ms")]
    pub seal_drain_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            storage_node_id: StorageNodeId::default(),
            topic_id: TopicId::default(),
            log_stream_id: LogStreamId::default(),
            storage: StorageConfig::default(),
            commit_queue_capacity: DEFAULT_COMMIT_QUEUE_CAPACITY,
            replicate_queue_capacity: DEFAULT_REPLICATE_QUEUE_CAPACITY,
            sync_batch_size: DEFAULT_SYNC_BATCH_SIZE,
            seal_drain_timeout: DEFAULT_SEAL_DRAIN_TIMEOUT,
        }
    }
}

impl ExecutorConfig {
    pub fn new(
        storage_node_id: StorageNodeId,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        storage: StorageConfig,
    ) -> Self {
        Self {
            storage_node_id,
            topic_id,
            log_stream_id,
            storage,
            ..Self::default()
        }
    }

    pub fn with_commit_queue_capacity(mut self, capacity: usize) -> Self {
        self.commit_queue_capacity = capacity;
        self
    }

    pub fn with_replicate_queue_capacity(mut self, capacity: usize) -> Self {
        self.replicate_queue_capacity = capacity;
        self
    }

    pub fn with_sync_batch_size(mut self, size: usize) -> Self {
        self.sync_batch_size = size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        if self.commit_queue_capacity == 0 || self.replicate_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "executor: queue capacities must be positive".into(),
            ));
        }
        if self.sync_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "executor: sync_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_queue_is_rejected() {
        let config = ExecutorConfig::new(
            StorageNodeId(1),
            TopicId(1),
            LogStreamId(1),
            StorageConfig::new("/tmp/ls"),
        );
        assert!(config.validate().is_ok());
        assert!(config
            .clone()
            .with_commit_queue_capacity(0)
            .validate()
            .is_err());
        assert!(config.with_sync_batch_size(0).validate().is_err());
    }

    #[test]
    fn durations_use_milliseconds() {
        let config: ExecutorConfig =
            serde_json::from_str(r#"{"seal_drain_timeout_ms": 250, "log_stream_id": 7}"#).unwrap();
        assert_eq!(config.seal_drain_timeout, Duration::from_millis(250));
        assert_eq!(config.log_stream_id, LogStreamId(7));
        assert_eq!(config.commit_queue_capacity, DEFAULT_COMMIT_QUEUE_CAPACITY);
    }
}
