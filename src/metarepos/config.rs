use crate::config::ConfigError;
use crate::raft::RaftConfig;
use crate::types::{ClusterId, NodeId};
use crate::util::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REPLICATION_FACTOR: usize = 1;
pub const DEFAULT_COMMIT_TICK: Duration = Duration::from_millis(10);
pub const DEFAULT_PROPOSE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_PROPOSE_RETRY_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_PUSH_ATTEMPTS: usize = 3;
pub const DEFAULT_PUSH_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataRepositoryConfig {
    pub cluster_id: ClusterId,
    /// Replicas every log stream must have.
    pub replication_factor: usize,
    pub raft: RaftConfig,
    /// Period of the leader's report/commit round.
    #[serde(rename = "commit_tick_ms", with = "crate::config::duration_ms")]
    pub commit_tick: Duration,
    /// How long a proposer waits to see its entry applied.
    #[serde(rename = "propose_timeout_ms", with = "crate::config::duration_ms")]
    pub propose_timeout: Duration,
    #[serde(rename = "propose_retry_delay_ms", with = "crate::config::duration_ms")]
    pub propose_retry_delay: Duration,
    pub push_attempts: usize,
    #[serde(rename = "push_backoff_ms", with = "crate::config::duration_ms")]
    pub push_backoff: Duration,
}

impl Default for MetadataRepositoryConfig {
    fn default() -> Self {
        Self {
            cluster_id: ClusterId::default(),
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            raft: RaftConfig::default(),
            commit_tick: DEFAULT_COMMIT_TICK,
            propose_timeout: DEFAULT_PROPOSE_TIMEOUT,
            propose_retry_delay: DEFAULT_PROPOSE_RETRY_DELAY,
            push_attempts: DEFAULT_PUSH_ATTEMPTS,
            push_backoff: DEFAULT_PUSH_BACKOFF,
        }
    }
}

impl MetadataRepositoryConfig {
    pub fn new(
        cluster_id: ClusterId,
        node_id: NodeId,
        url: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cluster_id,
            raft: RaftConfig::new(node_id, url, data_dir),
            ..Self::default()
        }
    }

    pub fn with_replication_factor(mut self, replication_factor: usize) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    pub fn with_commit_tick(mut self, commit_tick: Duration) -> Self {
        self.commit_tick = commit_tick;
        self
    }

    pub fn with_propose_timeout(mut self, propose_timeout: Duration) -> Self {
        self.propose_timeout = propose_timeout;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.raft.node_id
    }

    /// Retry schedule for proposals that hit a leaderless cluster.
    pub fn propose_retry(&self) -> RetryPolicy {
        let attempts = (self.propose_timeout.as_millis()
            / self.propose_retry_delay.as_millis().max(1))
        .max(1) as usize;
        RetryPolicy::linear(attempts, self.propose_retry_delay)
            .with_max_delay(self.propose_retry_delay)
            .with_time_budget(Some(self.propose_timeout))
    }

    pub fn push_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.push_attempts, self.push_backoff)
            .with_max_delay(self.commit_tick.max(self.push_backoff) * 10)
            .with_jitter(0.1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replication_factor == 0 {
            return Err(ConfigError::Invalid(
                "metadata repository: replication factor must be positive".into(),
            ));
        }
        if self.commit_tick.is_zero() || self.propose_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "metadata repository: commit tick and propose timeout must be positive".into(),
            ));
        }
        if self.push_attempts == 0 {
            return Err(ConfigError::Invalid(
                "metadata repository: push attempts must be positive".into(),
            ));
        }
        self.raft.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_and_reject_zero_factor() {
        let config =
            MetadataRepositoryConfig::new(ClusterId::new(1), NodeId::new(1), "mr-1", "/tmp/mr-1");
        config.validate().unwrap();
        assert!(config
            .clone()
            .with_replication_factor(0)
            .validate()
            .is_err());
        assert_eq!(config.propose_retry().max_attempts(), 60);
    }

    #[test]
    fn durations_round_trip_as_millis() {
        let config = MetadataRepositoryConfig::default().with_commit_tick(Duration::from_millis(25));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["commit_tick_ms"], 25);
        let decoded: MetadataRepositoryConfig = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.commit_tick, Duration::from_millis(25));
    }
}
