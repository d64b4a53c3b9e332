use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MEM_TABLE_SIZE: usize = 4 << 20;
pub const DEFAULT_L0_COMPACTION_THRESHOLD: i32 = 2;
pub const DEFAULT_L0_SLOWDOWN_WRITES_THRESHOLD: i32 = 12;
pub const DEFAULT_L0_STOP_WRITES_THRESHOLD: i32 = 20;
pub const DEFAULT_MAX_OPEN_FILES: i32 = 1000;

/// Options for one replica's storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Keep the data and commit columns in two physical stores under
    /// `data/` and `commit/`. Fixed for the lifetime of the directory.
    pub separate_db: bool,
    pub wal: bool,
    pub sync: bool,
    pub mem_table_size: usize,
    pub l0_compaction_threshold: i32,
    pub l0_slowdown_writes_threshold: i32,
    pub l0_stop_writes_threshold: i32,
    pub max_open_files: i32,
    pub verbose: bool,
    #[serde(rename = "metrics_log_interval_ms", with = "crate::config::duration_ms")]
    pub metrics_log_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            separate_db: false,
            wal: true,
            sync: true,
            mem_table_size: DEFAULT_MEM_TABLE_SIZE,
            l0_compaction_threshold: DEFAULT_L0_COMPACTION_THRESHOLD,
            l0_slowdown_writes_threshold: DEFAULT_L0_SLOWDOWN_WRITES_THRESHOLD,
            l0_stop_writes_threshold: DEFAULT_L0_STOP_WRITES_THRESHOLD,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            verbose: false,
            metrics_log_interval: Duration::ZERO,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_separate_db(mut self, separate_db: bool) -> Self {
        self.separate_db = separate_db;
        self
    }

    pub fn with_wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_metrics_log_interval(mut self, interval: Duration) -> Self {
        self.metrics_log_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage: path is empty".into()));
        }
        if !self.wal && self.sync {
            return Err(ConfigError::Invalid(
                "storage: sync writes require the WAL".into(),
            ));
        }
        if self.mem_table_size == 0 {
            return Err(ConfigError::Invalid(
                "storage: mem_table_size must be positive".into(),
            ));
        }
        if self.l0_stop_writes_threshold < self.l0_slowdown_writes_threshold {
            return Err(ConfigError::Invalid(format!(
                "storage: l0_stop_writes_threshold {} below slowdown threshold {}",
                self.l0_stop_writes_threshold, self.l0_slowdown_writes_threshold
            )));
        }
        Ok(())
    }
}
