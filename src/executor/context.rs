use crate::proto::LogSequenceNumber;
use crate::types::{Glsn, Llsn, Version};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Last applied commit round as seen by this replica: the global high
/// watermark and where its uncommitted suffix begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportCommitBase {
    pub version: Version,
    pub high_watermark: Glsn,
    pub uncommitted_llsn_begin: Llsn,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalWatermarks {
    pub low: LogSequenceNumber,
    pub high: LogSequenceNumber,
}

/// Shared progress counters of one replica. `uncommitted_llsn_end` is read on
/// every report without taking a lock.
pub struct LogStreamContext {
    base: Mutex<ReportCommitBase>,
    uncommitted_llsn_end: AtomicU64,
    watermarks: Mutex<LocalWatermarks>,
}

impl LogStreamContext {
    pub fn new(base: ReportCommitBase, uncommitted_llsn_end: Llsn, watermarks: LocalWatermarks) -> Self {
        Self {
            base: Mutex::new(base),
            uncommitted_llsn_end: AtomicU64::new(uncommitted_llsn_end.get()),
            watermarks: Mutex::new(watermarks),
        }
    }

    pub fn report_commit_base(&self) -> ReportCommitBase {
        *self.base.lock()
    }

    pub fn set_report_commit_base(&self, base: ReportCommitBase) {
        *self.base.lock() = base;
    }

    pub fn uncommitted_llsn_end(&self) -> Llsn {
        Llsn(self.uncommitted_llsn_end.load(Ordering::Acquire))
    }

    /// Moves the end forward by `count`; returns the previous end.
    pub fn advance_uncommitted_llsn_end(&self, count: u64) -> Llsn {
        Llsn(self.uncommitted_llsn_end.fetch_add(count, Ordering::AcqRel))
    }

    /// Only seal and sync completion rewind the end, after dropping the
    /// uncommitted suffix from storage.
    pub fn reset_uncommitted_llsn_end(&self, end: Llsn) {
        self.uncommitted_llsn_end.store(end.get(), Ordering::Release);
    }

    pub fn local_watermarks(&self) -> LocalWatermarks {
        *self.watermarks.lock()
    }

    /// Records the last committed position, seeding the low watermark on the
    /// first commit.
    pub fn advance_local_high_watermark(&self, first: LogSequenceNumber, last: LogSequenceNumber) {
        let mut watermarks = self.watermarks.lock();
        if watermarks.low.glsn.is_invalid() {
            watermarks.low = first;
        }
        watermarks.high = last;
    }

    pub fn set_local_low_watermark(&self, low: LogSequenceNumber) {
        self.watermarks.lock().low = low;
    }

    pub fn reset_local_watermarks(&self) {
        *self.watermarks.lock() = LocalWatermarks::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_watermark_is_set_once() {
        let ctx = LogStreamContext::new(ReportCommitBase::default(), Llsn::MIN, LocalWatermarks::default());
        ctx.advance_local_high_watermark(
            LogSequenceNumber::new(Llsn(1), Glsn(5)),
            LogSequenceNumber::new(Llsn(2), Glsn(6)),
        );
        ctx.advance_local_high_watermark(
            LogSequenceNumber::new(Llsn(3), Glsn(9)),
            LogSequenceNumber::new(Llsn(3), Glsn(9)),
        );
        let watermarks = ctx.local_watermarks();
        assert_eq!(watermarks.low.glsn, Glsn(5));
        assert_eq!(watermarks.high, LogSequenceNumber::new(Llsn(3), Glsn(9)));
    }

    #[test]
    fn advance_returns_previous_end() {
        let ctx = LogStreamContext::new(ReportCommitBase::default(), Llsn::MIN, LocalWatermarks::default());
        assert_eq!(ctx.advance_uncommitted_llsn_end(3), Llsn(1));
        assert_eq!(ctx.uncommitted_llsn_end(), Llsn(4));
    }
}
