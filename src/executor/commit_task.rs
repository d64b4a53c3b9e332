use crate::proto::LogStreamCommitResult;
use crate::types::{Glsn, Llsn, Version};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

const POOL_RETAIN_LIMIT: usize = 4096;

/// One commit round addressed to this replica, queued for the committer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTask {
    pub version: Version,
    pub high_watermark: Glsn,
    pub prev_high_watermark: Glsn,
    pub committed_glsn_begin: Glsn,
    pub committed_glsn_end: Glsn,
    pub committed_llsn_begin: Llsn,
    pub created_at: Option<Instant>,
    pub popped_at: Option<Instant>,
    pub processed_at: Option<Instant>,
}

impl Default for CommitTask {
    fn default() -> Self {
        Self {
            version: Version::INVALID,
            high_watermark: Glsn::INVALID,
            prev_high_watermark: Glsn::INVALID,
            committed_glsn_begin: Glsn::INVALID,
            committed_glsn_end: Glsn::INVALID,
            committed_llsn_begin: Llsn::INVALID,
            created_at: None,
            popped_at: None,
            processed_at: None,
        }
    }
}

impl CommitTask {
    pub fn fill(&mut self, result: &LogStreamCommitResult) {
        self.version = result.version;
        self.high_watermark = result.high_watermark;
        self.prev_high_watermark = result.prev_high_watermark;
        self.committed_glsn_begin = result.committed_glsn_offset;
        self.committed_glsn_end = result.committed_glsn_end();
        self.committed_llsn_begin = result.committed_llsn_offset;
        self.created_at = Some(Instant::now());
    }

    pub fn num_commits(&self) -> u64 {
        self.committed_glsn_end.distance_from(self.committed_glsn_begin)
    }

    /// A task at or below the already applied watermark has been superseded.
    pub fn stale(&self, high_watermark: Glsn) -> bool {
        self.high_watermark <= high_watermark
    }

    pub fn queued_for(&self) -> Option<Duration> {
        Some(self.popped_at?.saturating_duration_since(self.created_at?))
    }

    pub fn processed_for(&self) -> Option<Duration> {
        Some(self.processed_at?.saturating_duration_since(self.popped_at?))
    }

    fn reset(&mut self) {
        *self = CommitTask::default();
    }
}

/// Free list of commit tasks. Every task is cleared before it goes back.
#[derive(Default)]
pub struct CommitTaskPool {
    free: Mutex<Vec<Box<CommitTask>>>,
}

impl CommitTaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Box<CommitTask> {
        self.free.lock().pop().unwrap_or_default()
    }

    pub fn put(&self, mut task: Box<CommitTask>) {
        task.reset();
        let mut free = self.free.lock();
        if free.len() < POOL_RETAIN_LIMIT {
            free.push(task);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogStreamId, TopicId};

    fn result() -> LogStreamCommitResult {
        LogStreamCommitResult {
            topic_id: TopicId(1),
            log_stream_id: LogStreamId(1),
            version: Version(3),
            prev_high_watermark: Glsn(4),
            high_watermark: Glsn(9),
            committed_llsn_offset: Llsn(3),
            committed_glsn_offset: Glsn(6),
            committed_glsn_length: 2,
        }
    }

    #[test]
    fn fill_translates_result() {
        let mut task = CommitTask::default();
        task.fill(&result());
        assert_eq!(task.committed_glsn_begin, Glsn(6));
        assert_eq!(task.committed_glsn_end, Glsn(8));
        assert_eq!(task.committed_llsn_begin, Llsn(3));
        assert_eq!(task.num_commits(), 2);
        assert!(task.stale(Glsn(9)));
        assert!(!task.stale(Glsn(8)));
    }

    #[test]
    fn released_tasks_come_back_cleared() {
        let pool = CommitTaskPool::new();
        let mut task = pool.get();
        task.fill(&result());
        task.popped_at = Some(Instant::now());
        pool.put(task);
        assert_eq!(pool.idle(), 1);

        let reused = pool.get();
        assert_eq!(*reused, CommitTask::default());
        assert_eq!(pool.idle(), 0);
    }
}
