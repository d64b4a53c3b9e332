use super::{Executor, ExecutorError, ReportCommitBase};
use crate::proto::{
    LogEntry, LogSequenceNumber, LogStreamStatus, Replica, SyncPayload, SyncPosition, SyncRange,
    SyncState, SyncStatus,
};
use crate::replication::ReplicationClient;
use crate::storage::{AppendBatch, CommitContext, ScanRange, Storage};
use crate::types::{Glsn, Llsn, LogStreamId, Version};
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn position(lsn: LogSequenceNumber) -> SyncPosition {
    SyncPosition::new(lsn.llsn, lsn.glsn)
}

/// Everything a background sync needs once it has been handed off.
struct SyncJob {
    log_stream_id: LogStreamId,
    storage: Arc<Storage>,
    client: Arc<dyn ReplicationClient>,
    source: Replica,
    begin: Glsn,
    last: Glsn,
    commit_context: CommitContext,
    batch_size: usize,
    progress: Arc<Mutex<SyncStatus>>,
    cancel: CancellationToken,
}

impl Executor {
    /// Copies this replica's committed log into `replica`, ending with the
    /// commit context. Only a sealed or sealing replica whose last committed
    /// GLSN equals `last_glsn` can act as the source. Calling again while the
    /// copy runs returns its live progress.
    pub async fn sync(&self, replica: Replica, last_glsn: Glsn) -> Result<SyncStatus, ExecutorError> {
        self.ensure_open()?;
        let status = self.state.status();
        if !status.is_sealing_or_sealed() {
            return Err(ExecutorError::invalid_status("sync", status));
        }
        let running = self
            .syncs
            .lock()
            .get(&replica.storage_node_id)
            .map(|progress| progress.lock().clone())
            .filter(|current| !current.is_done());
        if let Some(current) = running {
            return Ok(current);
        }

        let watermarks = self.ctx.local_watermarks();
        if last_glsn != watermarks.high.glsn {
            return Err(ExecutorError::InvalidSync(format!(
                "last glsn {last_glsn} differs from local last committed {}",
                watermarks.high.glsn
            )));
        }
        if watermarks.low.glsn.is_invalid() {
            return Ok(SyncStatus {
                state: SyncState::Complete,
                ..SyncStatus::default()
            });
        }

        let mut status = SyncStatus {
            state: SyncState::Inprogress,
            first: position(watermarks.low),
            last: position(watermarks.high),
            ..SyncStatus::default()
        };
        let source = self.self_replica();
        let client = self.replicator.client(&replica).await?;
        let start = client
            .sync_init(&source, SyncRange::new(watermarks.low.glsn, watermarks.high.glsn))
            .await?;
        if start.glsn.is_invalid() || start.glsn > watermarks.high.glsn {
            status.state = SyncState::Complete;
            return Ok(status);
        }

        let commit_context = self.storage.read_commit_context()?;
        let progress = Arc::new(Mutex::new(status.clone()));
        self.syncs
            .lock()
            .insert(replica.storage_node_id, Arc::clone(&progress));
        info!(
            "event=sync_start lsid={} dst={} begin_glsn={} last_glsn={}",
            self.config.log_stream_id, replica.storage_node_id, start.glsn, watermarks.high.glsn
        );
        let job = SyncJob {
            log_stream_id: self.config.log_stream_id,
            storage: Arc::clone(&self.storage),
            client,
            source,
            begin: start.glsn.max(watermarks.low.glsn),
            last: watermarks.high.glsn,
            commit_context,
            batch_size: self.config.sync_batch_size,
            progress,
            cancel: self.shutdown.child_token(),
        };
        tokio::spawn(job.run());
        Ok(status)
    }

    /// Destination side: drops the uncommitted suffix, decides where the
    /// source should start and moves this replica to Learning.
    pub(crate) async fn sync_init(
        &self,
        source: &Replica,
        range: SyncRange,
    ) -> Result<SyncPosition, ExecutorError> {
        self.ensure_open()?;
        if range.is_empty() {
            return Err(ExecutorError::InvalidSync(format!(
                "empty range [{}, {}]",
                range.first_glsn, range.last_glsn
            )));
        }
        let _exclusive = self.state.exclusive().await;
        let status = self.state.status();
        if !matches!(status, LogStreamStatus::Sealing | LogStreamStatus::Learning) {
            return Err(ExecutorError::invalid_status("sync_init", status));
        }
        let _commit = self.commit_lock.lock();
        let watermarks = self.ctx.local_watermarks();
        let base = self.ctx.report_commit_base();
        let local_last = watermarks.high.glsn;

        if !local_last.is_invalid() && local_last >= range.last_glsn {
            info!(
                "event=sync_init_noop lsid={} src={} local_last={local_last} last={}",
                self.config.log_stream_id, source.storage_node_id, range.last_glsn
            );
            return Ok(SyncPosition::default());
        }

        let start = if !local_last.is_invalid() && local_last.next() >= range.first_glsn {
            self.storage.delete_uncommitted(base.uncommitted_llsn_begin)?;
            self.ctx.reset_uncommitted_llsn_end(base.uncommitted_llsn_begin);
            SyncPosition::new(watermarks.high.llsn.next(), local_last.next())
        } else {
            // Nothing local connects to the source's range: start over.
            self.storage.purge()?;
            self.ctx.set_report_commit_base(ReportCommitBase {
                version: Version::INVALID,
                high_watermark: Glsn::INVALID,
                uncommitted_llsn_begin: Llsn::MIN,
            });
            self.ctx.reset_uncommitted_llsn_end(Llsn::MIN);
            self.ctx.reset_local_watermarks();
            SyncPosition::new(Llsn::INVALID, range.first_glsn)
        };

        self.state.set(LogStreamStatus::Learning);
        *self.sync_source.lock() = Some(source.clone());
        info!(
            "event=sync_init lsid={} src={} start_glsn={} last_glsn={}",
            self.config.log_stream_id, source.storage_node_id, start.glsn, range.last_glsn
        );
        Ok(start)
    }

    /// Destination side: stores a shipped entry, or finishes the sync when the
    /// commit context arrives.
    pub(crate) fn sync_replicate(
        &self,
        source: &Replica,
        payload: SyncPayload,
    ) -> Result<(), ExecutorError> {
        self.ensure_open()?;
        let status = self.state.status();
        if status != LogStreamStatus::Learning {
            return Err(ExecutorError::invalid_status("sync_replicate", status));
        }
        let expected = self
            .sync_source
            .lock()
            .as_ref()
            .map(|replica| replica.storage_node_id);
        if expected != Some(source.storage_node_id) {
            return Err(ExecutorError::InvalidSync(format!(
                "unexpected sync source {}",
                source.storage_node_id
            )));
        }

        let _commit = self.commit_lock.lock();
        let mut batch: AppendBatch<'_> = self.storage.new_append_batch();
        match payload {
            SyncPayload::LogEntry(entry) => {
                let LogEntry { llsn, glsn, data } = entry;
                batch.set_log_entry(llsn, glsn, &data);
                batch.apply()?;
                let lsn = LogSequenceNumber::new(llsn, glsn);
                self.ctx.advance_local_high_watermark(lsn, lsn);
                self.ctx.reset_uncommitted_llsn_end(llsn.next());
            }
            SyncPayload::CommitContext(cc) => {
                let cc = CommitContext::from(cc);
                batch.set_commit_context(&cc);
                batch.apply()?;
                self.ctx.set_report_commit_base(ReportCommitBase {
                    version: cc.version,
                    high_watermark: cc.high_watermark,
                    uncommitted_llsn_begin: cc.committed_llsn_end(),
                });
                self.ctx.reset_uncommitted_llsn_end(cc.committed_llsn_end());
                self.sync_source.lock().take();
                self.state
                    .transition(LogStreamStatus::Learning, LogStreamStatus::Sealed);
                info!(
                    "event=sync_complete lsid={} src={} hwm={} last_glsn={}",
                    self.config.log_stream_id,
                    source.storage_node_id,
                    cc.high_watermark,
                    self.ctx.local_watermarks().high.glsn
                );
            }
        }
        Ok(())
    }
}

impl SyncJob {
    async fn run(self) {
        let outcome = self.ship().await;
        let mut progress = self.progress.lock();
        match outcome {
            Ok(()) => {
                progress.state = SyncState::Complete;
                info!(
                    "event=sync_done lsid={} current_glsn={}",
                    self.log_stream_id, progress.current.glsn
                );
            }
            Err(err) => {
                warn!("event=sync_failed lsid={} error={err}", self.log_stream_id);
                progress.state = SyncState::Error;
                progress.error = Some(err.to_string());
            }
        }
    }

    async fn ship(&self) -> Result<(), ExecutorError> {
        let mut next = self.begin;
        let step = self.batch_size as u64;
        while next <= self.last {
            let end = (next + step).min(self.last.next());
            let entries = self
                .storage
                .new_scanner(ScanRange::Glsn { begin: next, end })
                .collect::<Result<Vec<_>, _>>()?;
            for entry in entries {
                if self.cancel.is_cancelled() {
                    return Err(ExecutorError::Closed);
                }
                let lsn = entry.position();
                self.client
                    .sync_replicate(&self.source, SyncPayload::LogEntry(entry))
                    .await?;
                self.progress.lock().current = position(lsn);
            }
            next = end;
        }
        self.client
            .sync_replicate(&self.source, SyncPayload::CommitContext(self.commit_context.into()))
            .await?;
        Ok(())
    }
}
