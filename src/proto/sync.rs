use crate::proto::log_entry::LogEntry;
use crate::types::{Glsn, Llsn, Version};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Inprogress,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPosition {
    pub llsn: Llsn,
    pub glsn: Glsn,
}

impl SyncPosition {
    pub fn new(llsn: Llsn, glsn: Glsn) -> Self {
        Self { llsn, glsn }
    }
}

/// Inclusive GLSN range offered by a sync source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRange {
    pub first_glsn: Glsn,
    pub last_glsn: Glsn,
}

impl SyncRange {
    pub fn new(first_glsn: Glsn, last_glsn: Glsn) -> Self {
        Self {
            first_glsn,
            last_glsn,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first_glsn.is_invalid() || self.first_glsn > self.last_glsn
    }
}

/// Observable progress of one sync; `current` is the last position shipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub first: SyncPosition,
    pub last: SyncPosition,
    pub current: SyncPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self.state, SyncState::Inprogress)
    }
}

/// Commit context shipped at the end of a sync so the destination can rebuild
/// its report base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCommitContext {
    pub version: Version,
    pub high_watermark: Glsn,
    pub committed_glsn_begin: Glsn,
    pub committed_glsn_end: Glsn,
    pub committed_llsn_begin: Llsn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPayload {
    LogEntry(LogEntry),
    CommitContext(SyncCommitContext),
}
