//! One log-stream replica inside a storage node.
//!
//! The executor owns the replica's storage, assigns LLSNs to appends on the
//! primary, accepts replicated entries on backups, reports its uncommitted
//! suffix to the metadata repository and applies the commit rounds it gets
//! back.

pub mod commit_task;
pub mod committer;
pub mod config;
pub mod context;
pub mod error;
pub mod replicate_task;
pub mod replicator;
pub mod state;
mod sync;
pub mod waiters;

pub use commit_task::{CommitTask, CommitTaskPool};
pub use config::ExecutorConfig;
pub use context::{LocalWatermarks, LogStreamContext, ReportCommitBase};
pub use error::ExecutorError;
pub use replicator::Replicator;
pub use state::ExecutorState;

use crate::proto::{
    LogSequenceNumber, LogStreamCommitResult, LogStreamReplicaMetadata, LogStreamStatus,
    LogStreamUncommitReport, Replica, SyncPayload, SyncPosition, SyncRange, SyncStatus,
};
use crate::replication::{ConnectorFactory, ReplicationError, ReplicationHandler};
use crate::storage::{RecoveryPoints, ScanRange, Storage};
use crate::types::{Glsn, Llsn, LogStreamId, StorageNodeId, TopicId, Version};
use async_trait::async_trait;
use committer::{CommitApplier, Committer};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use replicate_task::ReplicateTask;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use waiters::AppendWaiters;

pub struct Executor {
    config: ExecutorConfig,
    storage: Arc<Storage>,
    state: Arc<ExecutorState>,
    ctx: Arc<LogStreamContext>,
    waiters: Arc<AppendWaiters>,
    commit_lock: Arc<Mutex<()>>,
    committer: Committer,
    replicator: Replicator,
    /// Serializes LLSN assignment and the matching replicate enqueue.
    writer: tokio::sync::Mutex<()>,
    replicas: RwLock<Vec<Replica>>,
    /// Outgoing syncs keyed by destination storage node.
    syncs: Mutex<HashMap<StorageNodeId, Arc<Mutex<SyncStatus>>>>,
    /// Source of the sync this replica is currently learning from.
    sync_source: Mutex<Option<Replica>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Executor {
    /// Opens the replica's storage and rebuilds its counters from it. Must be
    /// called inside a tokio runtime; the committer and replicator are spawned
    /// here.
    pub fn open(
        config: ExecutorConfig,
        replicas: Vec<Replica>,
        connectors: Arc<dyn ConnectorFactory>,
    ) -> Result<Arc<Self>, ExecutorError> {
        config.validate()?;
        let storage = Arc::new(Storage::open(config.storage.clone())?);
        let recovery = storage.read_recovery_points()?;
        let (base, uncommitted_llsn_end, watermarks, status) = recover(&recovery);
        if let (Some(cc), Some(last)) = (recovery.last_commit_context, recovery.last_committed) {
            if committed_tail_mismatch(&recovery) {
                warn!(
                    "event=executor_recovery_mismatch lsid={} cc_llsn_end={} last_llsn={} last_glsn={}",
                    config.log_stream_id,
                    cc.committed_llsn_end(),
                    last.llsn,
                    last.glsn
                );
            }
        }
        info!(
            "event=executor_open lsid={} snid={} status={} hwm={} uncommitted_begin={} uncommitted_end={}",
            config.log_stream_id,
            config.storage_node_id,
            status.as_str(),
            base.high_watermark,
            base.uncommitted_llsn_begin,
            uncommitted_llsn_end
        );

        let state = Arc::new(ExecutorState::new(status));
        let ctx = Arc::new(LogStreamContext::new(base, uncommitted_llsn_end, watermarks));
        let waiters = Arc::new(AppendWaiters::default());
        let commit_lock = Arc::new(Mutex::new(()));
        let committer = Committer::start(
            CommitApplier {
                log_stream_id: config.log_stream_id,
                storage: Arc::clone(&storage),
                ctx: Arc::clone(&ctx),
                state: Arc::clone(&state),
                waiters: Arc::clone(&waiters),
                commit_lock: Arc::clone(&commit_lock),
            },
            config.commit_queue_capacity,
        );
        let replicator = Replicator::start(
            config.log_stream_id,
            config.replicate_queue_capacity,
            connectors,
            Arc::clone(&state),
        );
        Ok(Arc::new(Self {
            config,
            storage,
            state,
            ctx,
            waiters,
            commit_lock,
            committer,
            replicator,
            writer: tokio::sync::Mutex::new(()),
            replicas: RwLock::new(replicas),
            syncs: Mutex::new(HashMap::new()),
            sync_source: Mutex::new(None),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn topic_id(&self) -> TopicId {
        self.config.topic_id
    }

    pub fn log_stream_id(&self) -> LogStreamId {
        self.config.log_stream_id
    }

    pub fn storage_node_id(&self) -> StorageNodeId {
        self.config.storage_node_id
    }

    pub fn status(&self) -> LogStreamStatus {
        self.state.status()
    }

    pub fn seal_reason(&self) -> Option<String> {
        self.state.seal_reason()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn replicas(&self) -> Vec<Replica> {
        self.replicas.read().clone()
    }

    /// The first replica in the list is the primary.
    pub fn is_primary(&self) -> bool {
        self.replicas
            .read()
            .first()
            .map(|replica| replica.storage_node_id == self.config.storage_node_id)
            .unwrap_or(false)
    }

    fn backups(&self) -> Vec<Replica> {
        self.replicas
            .read()
            .iter()
            .filter(|replica| replica.storage_node_id != self.config.storage_node_id)
            .cloned()
            .collect()
    }

    fn self_replica(&self) -> Replica {
        self.replicas
            .read()
            .iter()
            .find(|replica| replica.storage_node_id == self.config.storage_node_id)
            .cloned()
            .unwrap_or_else(|| {
                Replica::new(
                    self.config.storage_node_id,
                    self.config.topic_id,
                    self.config.log_stream_id,
                    String::new(),
                )
            })
    }

    fn ensure_open(&self) -> Result<(), ExecutorError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecutorError::Closed);
        }
        Ok(())
    }

    /// Appends a batch on the primary and resolves once every entry has been
    /// committed, yielding the assigned positions in order.
    pub async fn append(&self, batch: Vec<Vec<u8>>) -> Result<Vec<LogSequenceNumber>, ExecutorError> {
        self.ensure_open()?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if !self.is_primary() {
            return Err(ExecutorError::NotPrimary);
        }
        let pending = {
            let _barrier = self.state.guard("append", LogStreamStatus::Running).await?;
            let _writer = self.writer.lock().await;
            let begin = self.ctx.uncommitted_llsn_end();
            let count = batch.len() as u64;
            let mut write = self.storage.new_write_batch();
            for (offset, data) in batch.iter().enumerate() {
                write.set(begin + offset as u64, data);
            }
            write.apply()?;
            let pending: Vec<_> = (0..count)
                .map(|offset| (begin + offset, self.waiters.register(begin + offset)))
                .collect();
            self.ctx.advance_uncommitted_llsn_end(count);

            let backups = self.backups();
            if !backups.is_empty() {
                let task = ReplicateTask::new(begin, batch, backups);
                if let Err(err) = self.replicator.send(task).await {
                    self.state
                        .set_sealing_with_reason(format!("replicator rejected batch: {err}"));
                    return Err(err.into());
                }
            }
            pending
        };

        let mut positions = Vec::with_capacity(pending.len());
        for (llsn, rx) in pending {
            let glsn = rx.await.map_err(|_| ExecutorError::AppendAborted)?;
            positions.push(LogSequenceNumber::new(llsn, glsn));
        }
        Ok(positions)
    }

    /// Stores one entry shipped by the primary. Entries must arrive gapless.
    pub async fn replicate(&self, llsn: Llsn, data: &[u8]) -> Result<(), ExecutorError> {
        self.ensure_open()?;
        let _barrier = self
            .state
            .guard("replicate", LogStreamStatus::Running)
            .await?;
        let _writer = self.writer.lock().await;
        let expected = self.ctx.uncommitted_llsn_end();
        if llsn != expected {
            return Err(ExecutorError::ReplicateGap {
                expected,
                actual: llsn,
            });
        }
        let mut write = self.storage.new_write_batch();
        write.set(llsn, data);
        write.apply()?;
        self.ctx.advance_uncommitted_llsn_end(1);
        Ok(())
    }

    pub fn get_report(&self) -> Result<LogStreamUncommitReport, ExecutorError> {
        self.ensure_open()?;
        let base = self.ctx.report_commit_base();
        let end = self.ctx.uncommitted_llsn_end();
        Ok(LogStreamUncommitReport::new(
            self.config.log_stream_id,
            base.high_watermark,
            base.uncommitted_llsn_begin,
            end.distance_from(base.uncommitted_llsn_begin),
        ))
    }

    /// Queues a commit round for the committer. Rounds at or below the local
    /// high watermark are rejected up front.
    pub async fn commit(&self, result: &LogStreamCommitResult) -> Result<(), ExecutorError> {
        self.ensure_open()?;
        let local = self.ctx.report_commit_base().high_watermark;
        if result.high_watermark <= local {
            return Err(ExecutorError::TooOldCommitResult {
                commit: result.high_watermark,
                local,
            });
        }
        let mut task = self.committer.pool().get();
        task.fill(result);
        self.committer.send(task).await
    }

    /// Drives the replica toward Sealed at `last_committed_glsn`. Returns the
    /// resulting status and the local last committed GLSN; a replica that has
    /// not yet caught up stays Sealing.
    pub async fn seal(
        &self,
        last_committed_glsn: Glsn,
    ) -> Result<(LogStreamStatus, Glsn), ExecutorError> {
        self.ensure_open()?;
        self.state.set_sealing();
        let local = self.ctx.local_watermarks().high.glsn;
        let status = self.state.status();
        match status {
            LogStreamStatus::Sealing => {}
            LogStreamStatus::Sealed if local > last_committed_glsn => {
                return Err(ExecutorError::SealTargetBehind {
                    local,
                    target: last_committed_glsn,
                });
            }
            LogStreamStatus::Sealed | LogStreamStatus::Learning => return Ok((status, local)),
            _ => return Err(ExecutorError::invalid_status("seal", status)),
        }
        if local > last_committed_glsn {
            return Err(ExecutorError::SealTargetBehind {
                local,
                target: last_committed_glsn,
            });
        }
        if local < last_committed_glsn {
            debug!(
                "event=replica_seal_pending lsid={} local={local} target={last_committed_glsn}",
                self.config.log_stream_id
            );
            return Ok((LogStreamStatus::Sealing, local));
        }

        let cancel = CancellationToken::new();
        let drained = tokio::time::timeout(
            self.config.seal_drain_timeout,
            self.replicator.wait_for_drainage(&cancel),
        )
        .await;
        if !matches!(drained, Ok(Ok(()))) {
            warn!(
                "event=replica_seal_drain_timeout lsid={} inflight={}",
                self.config.log_stream_id,
                self.replicator.inflight()
            );
            return Ok((LogStreamStatus::Sealing, local));
        }

        let _exclusive = self.state.exclusive().await;
        let _commit = self.commit_lock.lock();
        let local = self.ctx.local_watermarks().high.glsn;
        if local != last_committed_glsn {
            return Ok((self.state.status(), local));
        }
        let base = self.ctx.report_commit_base();
        self.storage.delete_uncommitted(base.uncommitted_llsn_begin)?;
        self.ctx.reset_uncommitted_llsn_end(base.uncommitted_llsn_begin);
        let aborted = self.waiters.fail_all();
        self.state
            .transition(LogStreamStatus::Sealing, LogStreamStatus::Sealed);
        info!(
            "event=replica_sealed lsid={} last_committed_glsn={local} uncommitted_begin={} aborted_appends={aborted}",
            self.config.log_stream_id, base.uncommitted_llsn_begin
        );
        Ok((self.state.status(), local))
    }

    /// Reopens a sealed replica for appends, optionally with a new replica
    /// set.
    pub async fn unseal(&self, replicas: Option<Vec<Replica>>) -> Result<(), ExecutorError> {
        self.ensure_open()?;
        let status = self.state.status();
        if status != LogStreamStatus::Sealed {
            return Err(ExecutorError::invalid_status("unseal", status));
        }
        if let Some(replicas) = replicas {
            *self.replicas.write() = replicas;
        }
        self.replicator.reset_connector().await;
        if !self
            .state
            .transition(LogStreamStatus::Sealed, LogStreamStatus::Running)
        {
            return Err(ExecutorError::invalid_status("unseal", self.state.status()));
        }
        self.state.clear_seal_reason();
        info!("event=replica_unsealed lsid={}", self.config.log_stream_id);
        Ok(())
    }

    pub fn trim(&self, glsn: Glsn) -> Result<(), ExecutorError> {
        self.ensure_open()?;
        self.storage.trim(glsn)?;
        let next = self
            .storage
            .new_scanner(ScanRange::Glsn {
                begin: glsn.next(),
                end: Glsn::MAX,
            })
            .next();
        match next {
            Some(Ok(entry)) => self.ctx.set_local_low_watermark(entry.position()),
            Some(Err(err)) => return Err(err.into()),
            None => self.ctx.set_local_low_watermark(LogSequenceNumber::default()),
        }
        Ok(())
    }

    pub fn metadata(&self) -> LogStreamReplicaMetadata {
        let base = self.ctx.report_commit_base();
        let watermarks = self.ctx.local_watermarks();
        LogStreamReplicaMetadata {
            storage_node_id: self.config.storage_node_id,
            topic_id: self.config.topic_id,
            log_stream_id: self.config.log_stream_id,
            status: self.state.status(),
            version: base.version,
            high_watermark: base.high_watermark,
            local_low_watermark: watermarks.low,
            local_high_watermark: watermarks.high,
            uncommitted_llsn_begin: base.uncommitted_llsn_begin,
            uncommitted_llsn_end: self.ctx.uncommitted_llsn_end(),
            path: self.storage.path().display().to_string(),
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.replicator.stop().await;
        self.committer.stop().await;
        let aborted = self.waiters.fail_all();
        if let Err(err) = self.storage.close() {
            warn!(
                "event=executor_close_failed lsid={} error={err}",
                self.config.log_stream_id
            );
        }
        info!(
            "event=executor_closed lsid={} aborted_appends={aborted}",
            self.config.log_stream_id
        );
    }
}

fn recover(
    recovery: &RecoveryPoints,
) -> (ReportCommitBase, Llsn, LocalWatermarks, LogStreamStatus) {
    let base = match recovery.last_commit_context {
        Some(cc) => ReportCommitBase {
            version: cc.version,
            high_watermark: cc.high_watermark,
            uncommitted_llsn_begin: cc.committed_llsn_end(),
        },
        None => ReportCommitBase {
            version: Version::INVALID,
            high_watermark: Glsn::INVALID,
            uncommitted_llsn_begin: Llsn::MIN,
        },
    };
    let uncommitted_llsn_end = if recovery.has_uncommitted() {
        recovery.uncommitted_llsn_end
    } else {
        base.uncommitted_llsn_begin
    };
    let watermarks = LocalWatermarks {
        low: recovery.first_committed.unwrap_or_default(),
        high: recovery.last_committed.unwrap_or_default(),
    };
    let orphaned = recovery.last_commit_context.is_none() && recovery.last_committed.is_some();
    let mismatch = committed_tail_mismatch(recovery);
    let status = if recovery.has_uncommitted() || orphaned || mismatch {
        LogStreamStatus::Sealing
    } else {
        LogStreamStatus::Running
    };
    (base, uncommitted_llsn_end, watermarks, status)
}

/// The last committed entry does not end where the commit context says the
/// committed log ends, e.g. after a sync that stopped before its commit
/// context arrived.
fn committed_tail_mismatch(recovery: &RecoveryPoints) -> bool {
    match (recovery.last_commit_context, recovery.last_committed) {
        (Some(cc), Some(last)) => last.llsn.next() != cc.committed_llsn_end(),
        _ => false,
    }
}

fn rejected(err: ExecutorError) -> ReplicationError {
    match err {
        ExecutorError::Replication(err) => err,
        other => ReplicationError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl ReplicationHandler for Executor {
    async fn handle_replicate(&self, llsn: Llsn, data: Vec<u8>) -> Result<(), ReplicationError> {
        self.replicate(llsn, &data).await.map_err(rejected)
    }

    async fn handle_sync_init(
        &self,
        source: &Replica,
        range: SyncRange,
    ) -> Result<SyncPosition, ReplicationError> {
        self.sync_init(source, range).await.map_err(rejected)
    }

    async fn handle_sync_replicate(
        &self,
        source: &Replica,
        payload: SyncPayload,
    ) -> Result<(), ReplicationError> {
        self.sync_replicate(source, payload).map_err(rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::LocalReplicationNetwork;
    use crate::storage::{CommitContext, StorageConfig};
    use std::sync::Weak;
    use std::time::Duration;
    use tempfile::TempDir;

    const TOPIC: TopicId = TopicId(1);
    const LSID: LogStreamId = LogStreamId(1);

    fn replica(snid: i32) -> Replica {
        Replica::new(StorageNodeId(snid), TOPIC, LSID, format!("sn{snid}"))
    }

    fn open(
        tmp: &TempDir,
        snid: i32,
        replicas: Vec<Replica>,
        network: &LocalReplicationNetwork,
    ) -> Arc<Executor> {
        let config = ExecutorConfig::new(
            StorageNodeId(snid),
            TOPIC,
            LSID,
            StorageConfig::new(tmp.path().join(format!("sn{snid}"))),
        );
        let executor = Executor::open(config, replicas, Arc::new(network.clone())).unwrap();
        let handler = Arc::downgrade(&executor) as Weak<dyn ReplicationHandler>;
        network.register(StorageNodeId(snid), LSID, handler);
        executor
    }

    fn commit_result(
        prev_hwm: u64,
        hwm: u64,
        llsn_offset: u64,
        glsn_offset: u64,
        length: u64,
    ) -> LogStreamCommitResult {
        LogStreamCommitResult {
            topic_id: TOPIC,
            log_stream_id: LSID,
            version: Version(hwm),
            prev_high_watermark: Glsn(prev_hwm),
            high_watermark: Glsn(hwm),
            committed_llsn_offset: Llsn(llsn_offset),
            committed_glsn_offset: Glsn(glsn_offset),
            committed_glsn_length: length,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn uncommitted_length(executor: &Executor) -> u64 {
        executor.get_report().unwrap().uncommitted_llsn_length
    }

    #[tokio::test]
    async fn append_resolves_once_committed() {
        let tmp = TempDir::new().unwrap();
        let network = LocalReplicationNetwork::new();
        let executor = open(&tmp, 1, vec![replica(1)], &network);

        let append = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.append(vec![b"a".to_vec(), b"b".to_vec()]).await })
        };
        wait_for(|| uncommitted_length(&executor) == 2).await;
        let report = executor.get_report().unwrap();
        assert_eq!(report.uncommitted_llsn_offset, Llsn(1));
        assert_eq!(report.high_watermark, Glsn::INVALID);

        executor.commit(&commit_result(0, 5, 1, 4, 2)).await.unwrap();
        let positions = append.await.unwrap().unwrap();
        assert_eq!(positions[0], LogSequenceNumber::new(Llsn(1), Glsn(4)));
        assert_eq!(positions[1], LogSequenceNumber::new(Llsn(2), Glsn(5)));

        let report = executor.get_report().unwrap();
        assert_eq!(report.high_watermark, Glsn(5));
        assert_eq!(report.uncommitted_llsn_offset, Llsn(3));
        assert_eq!(report.uncommitted_llsn_length, 0);
        assert_eq!(executor.storage().read_at_glsn(Glsn(4)).unwrap().data, b"a");
        executor.close().await;
    }

    #[tokio::test]
    async fn stale_commit_results_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let network = LocalReplicationNetwork::new();
        let executor = open(&tmp, 1, vec![replica(1)], &network);

        executor.commit(&commit_result(0, 3, 1, 1, 0)).await.unwrap();
        wait_for(|| executor.get_report().unwrap().high_watermark == Glsn(3)).await;
        assert!(matches!(
            executor.commit(&commit_result(0, 3, 1, 1, 0)).await,
            Err(ExecutorError::TooOldCommitResult { .. })
        ));
        executor.close().await;
    }

    #[tokio::test]
    async fn backups_and_non_primaries() {
        let tmp = TempDir::new().unwrap();
        let network = LocalReplicationNetwork::new();
        let replicas = vec![replica(1), replica(2)];
        let primary = open(&tmp, 1, replicas.clone(), &network);
        let backup = open(&tmp, 2, replicas, &network);
        assert!(primary.is_primary());
        assert!(!backup.is_primary());
        assert!(matches!(
            backup.append(vec![b"x".to_vec()]).await,
            Err(ExecutorError::NotPrimary)
        ));

        let append = {
            let primary = Arc::clone(&primary);
            tokio::spawn(async move { primary.append(vec![b"x".to_vec()]).await })
        };
        wait_for(|| uncommitted_length(&backup) == 1).await;
        assert!(matches!(
            backup.replicate(Llsn(5), b"gap").await,
            Err(ExecutorError::ReplicateGap { .. })
        ));

        let result = commit_result(0, 1, 1, 1, 1);
        primary.commit(&result).await.unwrap();
        backup.commit(&result).await.unwrap();
        append.await.unwrap().unwrap();
        wait_for(|| backup.get_report().unwrap().high_watermark == Glsn(1)).await;
        assert_eq!(backup.storage().read_at_glsn(Glsn(1)).unwrap().data, b"x");
        primary.close().await;
        backup.close().await;
    }

    #[tokio::test]
    async fn seal_drops_the_uncommitted_suffix() {
        let tmp = TempDir::new().unwrap();
        let network = LocalReplicationNetwork::new();
        let executor = open(&tmp, 1, vec![replica(1)], &network);

        let first = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.append(vec![b"a".to_vec(), b"b".to_vec()]).await })
        };
        wait_for(|| uncommitted_length(&executor) == 2).await;
        executor.commit(&commit_result(0, 2, 1, 1, 2)).await.unwrap();
        first.await.unwrap().unwrap();

        let pending = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.append(vec![b"c".to_vec()]).await })
        };
        wait_for(|| uncommitted_length(&executor) == 1).await;

        let (status, local) = executor.seal(Glsn(4)).await.unwrap();
        assert_eq!((status, local), (LogStreamStatus::Sealing, Glsn(2)));
        let (status, local) = executor.seal(Glsn(2)).await.unwrap();
        assert_eq!((status, local), (LogStreamStatus::Sealed, Glsn(2)));
        assert!(matches!(
            pending.await.unwrap(),
            Err(ExecutorError::AppendAborted)
        ));
        assert_eq!(uncommitted_length(&executor), 0);
        assert!(matches!(
            executor.append(vec![b"d".to_vec()]).await,
            Err(ExecutorError::InvalidStatus { .. })
        ));
        assert!(matches!(
            executor.seal(Glsn(1)).await,
            Err(ExecutorError::SealTargetBehind { .. })
        ));

        executor.unseal(None).await.unwrap();
        assert_eq!(executor.status(), LogStreamStatus::Running);
        executor.close().await;
    }

    #[tokio::test]
    async fn reopen_recovers_commit_base_and_seals_on_uncommitted_data() {
        let tmp = TempDir::new().unwrap();
        let network = LocalReplicationNetwork::new();
        {
            let executor = open(&tmp, 1, vec![replica(1)], &network);
            let append = {
                let executor = Arc::clone(&executor);
                tokio::spawn(async move { executor.append(vec![b"a".to_vec()]).await })
            };
            wait_for(|| uncommitted_length(&executor) == 1).await;
            executor.commit(&commit_result(0, 7, 1, 7, 1)).await.unwrap();
            append.await.unwrap().unwrap();

            let dangling = {
                let executor = Arc::clone(&executor);
                tokio::spawn(async move { executor.append(vec![b"b".to_vec()]).await })
            };
            wait_for(|| uncommitted_length(&executor) == 1).await;
            executor.close().await;
            assert!(dangling.await.unwrap().is_err());
        }

        let executor = open(&tmp, 1, vec![replica(1)], &network);
        assert_eq!(executor.status(), LogStreamStatus::Sealing);
        let report = executor.get_report().unwrap();
        assert_eq!(report.high_watermark, Glsn(7));
        assert_eq!(report.uncommitted_llsn_offset, Llsn(2));
        assert_eq!(report.uncommitted_llsn_length, 1);
        let metadata = executor.metadata();
        assert_eq!(metadata.local_high_watermark, LogSequenceNumber::new(Llsn(1), Glsn(7)));
        executor.close().await;
    }

    #[test]
    fn recovery_seals_when_the_committed_tail_misses_the_commit_context() {
        let consistent = RecoveryPoints {
            last_commit_context: Some(CommitContext {
                version: Version(9),
                high_watermark: Glsn(9),
                committed_glsn_begin: Glsn(8),
                committed_glsn_end: Glsn(10),
                committed_llsn_begin: Llsn(4),
            }),
            first_committed: Some(LogSequenceNumber::new(Llsn(1), Glsn(1))),
            last_committed: Some(LogSequenceNumber::new(Llsn(5), Glsn(9))),
            ..RecoveryPoints::default()
        };
        let (base, end, _, status) = recover(&consistent);
        assert_eq!(status, LogStreamStatus::Running);
        assert_eq!((base.uncommitted_llsn_begin, end), (Llsn(6), Llsn(6)));

        let partial = RecoveryPoints {
            last_committed: Some(LogSequenceNumber::new(Llsn(2), Glsn(2))),
            ..consistent.clone()
        };
        assert_eq!(recover(&partial).3, LogStreamStatus::Sealing);

        let trimmed = RecoveryPoints {
            first_committed: None,
            last_committed: None,
            ..consistent
        };
        assert_eq!(recover(&trimmed).3, LogStreamStatus::Running);
    }
}
