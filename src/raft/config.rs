use crate::config::ConfigError;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(300);
pub const DEFAULT_ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(600);
pub const DEFAULT_SNAP_COUNT: u64 = 10_000;
pub const DEFAULT_SNAP_CATCH_UP_COUNT: u64 = 5_000;
pub const DEFAULT_MAX_ENTRIES_PER_APPEND: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub node_id: NodeId,
    pub url: String,
    /// Founding voters, this node included. Ignored when joining.
    pub peers: BTreeMap<NodeId, String>,
    /// Start with an empty log and wait to be added by the leader.
    pub join: bool,
    pub data_dir: PathBuf,
    #[serde(rename = "tick_interval_ms", with = "crate::config::duration_ms")]
    pub tick_interval: Duration,
    #[serde(rename = "heartbeat_interval_ms", with = "crate::config::duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(rename = "election_timeout_min_ms", with = "crate::config::duration_ms")]
    pub election_timeout_min: Duration,
    #[serde(rename = "election_timeout_max_ms", with = "crate::config::duration_ms")]
    pub election_timeout_max: Duration,
    /// Applied entries between two snapshots.
    pub snap_count: u64,
    /// Entries kept behind a snapshot for slow followers.
    pub snap_catch_up_count: u64,
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::default(),
            url: String::new(),
            peers: BTreeMap::new(),
            join: false,
            data_dir: PathBuf::new(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            election_timeout_min: DEFAULT_ELECTION_TIMEOUT_MIN,
            election_timeout_max: DEFAULT_ELECTION_TIMEOUT_MAX,
            snap_count: DEFAULT_SNAP_COUNT,
            snap_catch_up_count: DEFAULT_SNAP_CATCH_UP_COUNT,
            max_entries_per_append: DEFAULT_MAX_ENTRIES_PER_APPEND,
        }
    }
}

impl RaftConfig {
    pub fn new(node_id: NodeId, url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        let url = url.into();
        let mut peers = BTreeMap::new();
        peers.insert(node_id, url.clone());
        Self {
            node_id,
            url,
            peers,
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_peers(mut self, peers: BTreeMap<NodeId, String>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_join(mut self, join: bool) -> Self {
        self.join = join;
        self
    }

    pub fn with_snapshot(mut self, snap_count: u64, snap_catch_up_count: u64) -> Self {
        self.snap_count = snap_count;
        self.snap_catch_up_count = snap_catch_up_count;
        self
    }

    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("raft: data_dir is empty".into()));
        }
        if !self.join && !self.peers.contains_key(&self.node_id) {
            return Err(ConfigError::Invalid(format!(
                "raft: node {} is not among the founding peers",
                self.node_id
            )));
        }
        if self.tick_interval.is_zero() || self.heartbeat_interval < self.tick_interval {
            return Err(ConfigError::Invalid(
                "raft: heartbeat interval must be at least one tick".into(),
            ));
        }
        if self.election_timeout_min <= self.heartbeat_interval
            || self.election_timeout_max < self.election_timeout_min
        {
            return Err(ConfigError::Invalid(
                "raft: election timeout window must exceed the heartbeat interval".into(),
            ));
        }
        if self.snap_count == 0 || self.snap_catch_up_count > self.snap_count {
            return Err(ConfigError::Invalid(
                "raft: snap_catch_up_count must not exceed a positive snap_count".into(),
            ));
        }
        if self.max_entries_per_append == 0 {
            return Err(ConfigError::Invalid(
                "raft: max_entries_per_append must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn founding_member_must_list_itself() {
        let config = RaftConfig::new(NodeId::new(1), "mr-1", "/tmp/mr-1");
        config.validate().unwrap();

        let mut peers = BTreeMap::new();
        peers.insert(NodeId::new(2), "mr-2".to_string());
        let err = config.clone().with_peers(peers.clone()).validate().unwrap_err();
        assert!(err.to_string().contains("founding peers"));
        config.with_peers(peers).with_join(true).validate().unwrap();
    }

    #[test]
    fn rejects_inverted_timeouts_and_snapshot_window() {
        let config = RaftConfig::new(NodeId::new(1), "mr-1", "/tmp/mr-1");
        assert!(config
            .clone()
            .with_election_timeout(Duration::from_millis(20), Duration::from_millis(40))
            .validate()
            .is_err());
        assert!(config.with_snapshot(10, 20).validate().is_err());
    }
}
