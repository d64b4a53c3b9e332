use crate::executor::commit_task::{CommitTask, CommitTaskPool};
use crate::executor::context::{LogStreamContext, ReportCommitBase};
use crate::executor::error::ExecutorError;
use crate::executor::state::ExecutorState;
use crate::executor::waiters::AppendWaiters;
use crate::proto::{LogSequenceNumber, LogStreamStatus};
use crate::storage::{CommitContext, Storage};
use crate::types::LogStreamId;
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything the committer touches while applying a round. Seal shares
/// `commit_lock` so that it never drops data under a running commit.
pub(crate) struct CommitApplier {
    pub log_stream_id: LogStreamId,
    pub storage: Arc<Storage>,
    pub ctx: Arc<LogStreamContext>,
    pub state: Arc<ExecutorState>,
    pub waiters: Arc<AppendWaiters>,
    pub commit_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitOutcome {
    Applied { committed: u64 },
    Stale,
    PrevHighWatermarkMismatch,
    Skipped,
    Sealed,
}

impl CommitApplier {
    pub(crate) fn apply(&self, task: &CommitTask) -> CommitOutcome {
        let _guard = self.commit_lock.lock();
        let lsid = self.log_stream_id;
        let base = self.ctx.report_commit_base();
        if task.stale(base.high_watermark) {
            trace!(
                "event=commit_discarded reason=stale lsid={lsid} hwm={} local_hwm={}",
                task.high_watermark,
                base.high_watermark
            );
            return CommitOutcome::Stale;
        }
        if task.prev_high_watermark != base.high_watermark {
            warn!(
                "event=commit_discarded reason=prev_hwm_mismatch lsid={lsid} prev_hwm={} local_hwm={}",
                task.prev_high_watermark, base.high_watermark
            );
            return CommitOutcome::PrevHighWatermarkMismatch;
        }
        if self.state.status() == LogStreamStatus::Learning {
            debug!("event=commit_discarded reason=learning lsid={lsid} hwm={}", task.high_watermark);
            return CommitOutcome::Skipped;
        }

        let num_commits = task.num_commits();
        if num_commits > 0 {
            if task.committed_llsn_begin != base.uncommitted_llsn_begin {
                self.state.set_sealing_with_reason(format!(
                    "commit llsn begin {} does not match uncommitted begin {}",
                    task.committed_llsn_begin, base.uncommitted_llsn_begin
                ));
                return CommitOutcome::Sealed;
            }
            let written = self
                .ctx
                .uncommitted_llsn_end()
                .distance_from(base.uncommitted_llsn_begin);
            if num_commits > written {
                self.state.set_sealing_with_reason(format!(
                    "commit of {num_commits} entries exceeds {written} written entries"
                ));
                return CommitOutcome::Sealed;
            }
        }

        let llsn_begin = base.uncommitted_llsn_begin;
        let cc = CommitContext {
            version: task.version,
            high_watermark: task.high_watermark,
            committed_glsn_begin: task.committed_glsn_begin,
            committed_glsn_end: task.committed_glsn_end,
            committed_llsn_begin: llsn_begin,
        };
        let mut batch = self.storage.new_commit_batch(&cc);
        for offset in 0..num_commits {
            batch.set(task.committed_glsn_begin + offset, llsn_begin + offset);
        }
        if let Err(err) = batch.apply() {
            error!("event=commit_apply_failed lsid={lsid} hwm={} error={err}", task.high_watermark);
            self.state
                .set_sealing_with_reason(format!("commit apply failed: {err}"));
            return CommitOutcome::Sealed;
        }

        self.ctx.set_report_commit_base(ReportCommitBase {
            version: task.version,
            high_watermark: task.high_watermark,
            uncommitted_llsn_begin: llsn_begin + num_commits,
        });
        if num_commits > 0 {
            let first = LogSequenceNumber::new(llsn_begin, task.committed_glsn_begin);
            let last = LogSequenceNumber::new(
                llsn_begin + (num_commits - 1),
                task.committed_glsn_end.prev(),
            );
            self.ctx.advance_local_high_watermark(first, last);
            self.waiters
                .resolve(llsn_begin, task.committed_glsn_begin, num_commits);
        }
        CommitOutcome::Applied {
            committed: num_commits,
        }
    }
}

/// Applies commit rounds in arrival order on a dedicated task so that the
/// caller delivering results never waits on storage. Each round is written
/// on the blocking pool; a slow fsync or a seal holding `commit_lock` only
/// parks a blocking thread.
pub struct Committer {
    tx: mpsc::Sender<Box<CommitTask>>,
    pool: Arc<CommitTaskPool>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Committer {
    pub(crate) fn start(applier: CommitApplier, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pool = Arc::new(CommitTaskPool::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(commit_loop(
            Arc::new(applier),
            rx,
            Arc::clone(&pool),
            cancel.clone(),
        ));
        Self {
            tx,
            pool,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn pool(&self) -> &CommitTaskPool {
        &self.pool
    }

    pub async fn send(&self, task: Box<CommitTask>) -> Result<(), ExecutorError> {
        if self.cancel.is_cancelled() {
            self.pool.put(task);
            return Err(ExecutorError::CommitterStopped);
        }
        match self.tx.send(task).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(task)) => {
                self.pool.put(task);
                Err(ExecutorError::CommitterStopped)
            }
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("event=committer_join_failed error={err}");
            }
        }
    }
}

async fn commit_loop(
    applier: Arc<CommitApplier>,
    mut rx: mpsc::Receiver<Box<CommitTask>>,
    pool: Arc<CommitTaskPool>,
    cancel: CancellationToken,
) {
    loop {
        let mut task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        task.popped_at = Some(Instant::now());
        let blocking = Arc::clone(&applier);
        let applied = tokio::task::spawn_blocking(move || {
            let outcome = blocking.apply(&task);
            (task, outcome)
        })
        .await;
        let (mut task, outcome) = match applied {
            Ok(applied) => applied,
            Err(err) => {
                error!(
                    "event=commit_apply_join_failed lsid={} error={err}",
                    applier.log_stream_id
                );
                applier
                    .state
                    .set_sealing_with_reason(format!("commit apply aborted: {err}"));
                break;
            }
        };
        task.processed_at = Some(Instant::now());
        trace!(
            "event=commit_task_done lsid={} hwm={} outcome={outcome:?} queued_us={} process_us={}",
            applier.log_stream_id,
            task.high_watermark,
            task.queued_for().unwrap_or_default().as_micros(),
            task.processed_for().unwrap_or_default().as_micros()
        );
        pool.put(task);
    }
    rx.close();
    while let Ok(task) = rx.try_recv() {
        pool.put(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::context::LocalWatermarks;
    use crate::storage::{ReadAt, StorageConfig};
    use crate::types::{Glsn, Llsn, Version};
    use tempfile::TempDir;

    fn applier(tmp: &TempDir) -> CommitApplier {
        let storage = Arc::new(Storage::open(StorageConfig::new(tmp.path())).unwrap());
        CommitApplier {
            log_stream_id: LogStreamId(1),
            storage,
            ctx: Arc::new(LogStreamContext::new(
                ReportCommitBase {
                    uncommitted_llsn_begin: Llsn::MIN,
                    ..ReportCommitBase::default()
                },
                Llsn::MIN,
                LocalWatermarks::default(),
            )),
            state: Arc::new(ExecutorState::new(LogStreamStatus::Running)),
            waiters: Arc::new(AppendWaiters::default()),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    fn write(applier: &CommitApplier, count: u64) {
        let begin = applier.ctx.uncommitted_llsn_end();
        let mut batch = applier.storage.new_write_batch();
        for offset in 0..count {
            batch.set(begin + offset, b"payload");
        }
        batch.apply().unwrap();
        applier.ctx.advance_uncommitted_llsn_end(count);
    }

    fn task(prev: u64, hwm: u64, glsn_begin: u64, len: u64, llsn_begin: u64) -> CommitTask {
        CommitTask {
            version: Version(hwm),
            high_watermark: Glsn(hwm),
            prev_high_watermark: Glsn(prev),
            committed_glsn_begin: Glsn(glsn_begin),
            committed_glsn_end: Glsn(glsn_begin + len),
            committed_llsn_begin: Llsn(llsn_begin),
            ..CommitTask::default()
        }
    }

    #[test]
    fn applies_round_and_advances_base() {
        let tmp = TempDir::new().unwrap();
        let applier = applier(&tmp);
        write(&applier, 3);

        assert_eq!(
            applier.apply(&task(0, 5, 3, 2, 1)),
            CommitOutcome::Applied { committed: 2 }
        );
        let base = applier.ctx.report_commit_base();
        assert_eq!(base.high_watermark, Glsn(5));
        assert_eq!(base.uncommitted_llsn_begin, Llsn(3));
        assert_eq!(
            applier.storage.read(ReadAt::Llsn(Llsn(2))).unwrap().glsn,
            Glsn(4)
        );
        assert_eq!(applier.ctx.local_watermarks().high.glsn, Glsn(4));
    }

    #[test]
    fn stale_and_out_of_order_rounds_are_discarded() {
        let tmp = TempDir::new().unwrap();
        let applier = applier(&tmp);
        write(&applier, 2);
        applier.apply(&task(0, 2, 1, 1, 1));

        assert_eq!(applier.apply(&task(0, 2, 1, 1, 1)), CommitOutcome::Stale);
        assert_eq!(
            applier.apply(&task(4, 6, 5, 1, 2)),
            CommitOutcome::PrevHighWatermarkMismatch
        );
        assert_eq!(applier.ctx.report_commit_base().high_watermark, Glsn(2));
    }

    #[test]
    fn committing_unwritten_entries_seals() {
        let tmp = TempDir::new().unwrap();
        let applier = applier(&tmp);
        write(&applier, 1);
        assert_eq!(applier.apply(&task(0, 3, 1, 3, 1)), CommitOutcome::Sealed);
        assert_eq!(applier.state.status(), LogStreamStatus::Sealing);
    }

    #[tokio::test]
    async fn commit_loop_keeps_the_runtime_free_while_storage_is_busy() {
        let tmp = TempDir::new().unwrap();
        let applier = applier(&tmp);
        write(&applier, 2);
        let ctx = Arc::clone(&applier.ctx);
        let commit_lock = Arc::clone(&applier.commit_lock);
        let committer = Committer::start(applier, 4);

        let held = commit_lock.lock();
        let mut round = committer.pool().get();
        *round = task(0, 2, 1, 2, 1);
        committer.send(round).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(ctx.report_commit_base().high_watermark, Glsn::INVALID);
        drop(held);

        for _ in 0..400 {
            if ctx.report_commit_base().high_watermark == Glsn(2) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(ctx.report_commit_base().uncommitted_llsn_begin, Llsn(3));
        committer.stop().await;
        assert!(committer.send(committer.pool().get()).await.is_err());
    }

    #[test]
    fn empty_round_moves_high_watermark_only() {
        let tmp = TempDir::new().unwrap();
        let applier = applier(&tmp);
        assert_eq!(
            applier.apply(&task(0, 4, 5, 0, 1)),
            CommitOutcome::Applied { committed: 0 }
        );
        let cc = applier.storage.read_commit_context().unwrap();
        assert!(cc.is_empty());
        assert_eq!(cc.high_watermark, Glsn(4));
        assert_eq!(cc.committed_llsn_end(), Llsn::MIN);
    }
}
