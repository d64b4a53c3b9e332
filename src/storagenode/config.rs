use crate::config::ConfigError;
use crate::executor::ExecutorConfig;
use crate::types::{ClusterId, StorageNodeId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageNodeConfig {
    pub cluster_id: ClusterId,
    pub storage_node_id: StorageNodeId,
    pub address: String,
    /// Directories that hold log-stream replicas; the first is the default.
    pub volumes: Vec<PathBuf>,
    /// Template for every hosted replica. Identifiers and the storage path
    /// are filled in per log stream.
    pub executor: ExecutorConfig,
}

impl Default for StorageNodeConfig {
    fn default() -> Self {
        Self {
            cluster_id: ClusterId::default(),
            storage_node_id: StorageNodeId::default(),
            address: String::new(),
            volumes: Vec::new(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl StorageNodeConfig {
    pub fn new(
        cluster_id: ClusterId,
        storage_node_id: StorageNodeId,
        volume: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cluster_id,
            storage_node_id,
            address: format!("sn-{storage_node_id}"),
            volumes: vec![volume.into()],
            ..Self::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.volumes.is_empty() {
            return Err(ConfigError::Invalid(
                "storage node: at least one volume is required".into(),
            ));
        }
        if self.address.is_empty() {
            return Err(ConfigError::Invalid("storage node: address is empty".into()));
        }
        if self.executor.commit_queue_capacity == 0 || self.executor.replicate_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "storage node: executor queue capacities must be positive".into(),
            ));
        }
        Ok(())
    }
}
