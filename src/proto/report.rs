use crate::types::{Glsn, Llsn, LogStreamId, StorageNodeId, TopicId, Version};
use serde::{Deserialize, Serialize};

/// A replica's view of its uncommitted suffix relative to the last global
/// high watermark it has applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamUncommitReport {
    pub log_stream_id: LogStreamId,
    pub high_watermark: Glsn,
    pub uncommitted_llsn_offset: Llsn,
    pub uncommitted_llsn_length: u64,
}

impl LogStreamUncommitReport {
    pub fn new(
        log_stream_id: LogStreamId,
        high_watermark: Glsn,
        uncommitted_llsn_offset: Llsn,
        uncommitted_llsn_length: u64,
    ) -> Self {
        Self {
            log_stream_id,
            high_watermark,
            uncommitted_llsn_offset,
            uncommitted_llsn_length,
        }
    }

    /// Exclusive end of the reported uncommitted range.
    pub fn uncommitted_llsn_end(&self) -> Llsn {
        self.uncommitted_llsn_offset + self.uncommitted_llsn_length
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeUncommitReport {
    pub storage_node_id: StorageNodeId,
    pub reports: Vec<LogStreamUncommitReport>,
}

impl StorageNodeUncommitReport {
    pub fn new(storage_node_id: StorageNodeId) -> Self {
        Self {
            storage_node_id,
            reports: Vec::new(),
        }
    }

    pub fn report_for(&self, log_stream_id: LogStreamId) -> Option<&LogStreamUncommitReport> {
        self.reports
            .iter()
            .find(|report| report.log_stream_id == log_stream_id)
    }
}

/// One log stream's slice of a global commit round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamCommitResult {
    pub topic_id: TopicId,
    pub log_stream_id: LogStreamId,
    pub version: Version,
    pub prev_high_watermark: Glsn,
    pub high_watermark: Glsn,
    pub committed_llsn_offset: Llsn,
    pub committed_glsn_offset: Glsn,
    pub committed_glsn_length: u64,
}

impl LogStreamCommitResult {
    pub fn committed_glsn_end(&self) -> Glsn {
        self.committed_glsn_offset + self.committed_glsn_length
    }

    /// Last GLSN this result assigns, or the one before its offset when it
    /// commits nothing.
    pub fn last_committed_glsn(&self) -> Glsn {
        self.committed_glsn_end().prev()
    }
}

/// A Version-tagged commit round covering every registered log stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalCommit {
    pub version: Version,
    pub high_watermark: Glsn,
    pub prev_high_watermark: Glsn,
    pub results: Vec<LogStreamCommitResult>,
}

impl GlobalCommit {
    pub fn result_for(&self, log_stream_id: LogStreamId) -> Option<&LogStreamCommitResult> {
        self.results
            .binary_search_by_key(&log_stream_id, |result| result.log_stream_id)
            .ok()
            .map(|idx| &self.results[idx])
    }

    pub fn total_committed(&self) -> u64 {
        self.results
            .iter()
            .map(|result| result.committed_glsn_length)
            .sum()
    }
}
