use crate::admin::cache::DEFAULT_RELOAD_INTERVAL;
use crate::config::ConfigError;
use crate::types::ClusterId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MR_CALL_ATTEMPTS: usize = 5;
pub const DEFAULT_MR_CALL_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub cluster_id: ClusterId,
    pub replication_factor: usize,
    /// How long cached cluster metadata is served before a reload.
    #[serde(rename = "metadata_reload_interval_ms", with = "crate::config::duration_ms")]
    pub metadata_reload_interval: Duration,
    pub mr_call_attempts: usize,
    #[serde(rename = "mr_call_backoff_ms", with = "crate::config::duration_ms")]
    pub mr_call_backoff: Duration,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            cluster_id: ClusterId::default(),
            replication_factor: 1,
            metadata_reload_interval: DEFAULT_RELOAD_INTERVAL,
            mr_call_attempts: DEFAULT_MR_CALL_ATTEMPTS,
            mr_call_backoff: DEFAULT_MR_CALL_BACKOFF,
        }
    }
}

impl AdminConfig {
    pub fn new(cluster_id: ClusterId, replication_factor: usize) -> Self {
        Self {
            cluster_id,
            replication_factor,
            ..Self::default()
        }
    }

    pub fn with_metadata_reload_interval(mut self, interval: Duration) -> Self {
        self.metadata_reload_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replication_factor == 0 {
            return Err(ConfigError::Invalid(
                "admin replication_factor must be positive".into(),
            ));
        }
        if self.mr_call_attempts == 0 {
            return Err(ConfigError::Invalid(
                "admin mr_call_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_in_defaults() {
        let config: AdminConfig =
            serde_json::from_str(r#"{"replication_factor": 3, "metadata_reload_interval_ms": 250}"#)
                .unwrap();
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.metadata_reload_interval, Duration::from_millis(250));
        assert_eq!(config.mr_call_attempts, DEFAULT_MR_CALL_ATTEMPTS);
        config.validate().unwrap();
        assert!(AdminConfig::new(ClusterId::new(1), 0).validate().is_err());
    }
}
