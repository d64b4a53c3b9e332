use crate::executor::replicate_task::ReplicateTask;
use crate::executor::state::ExecutorState;
use crate::proto::Replica;
use crate::replication::{Connector, ConnectorFactory, ReplicationClient, ReplicationError};
use crate::types::{Llsn, LogStreamId};
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Ships appended entries from the primary to its backups.
///
/// `inflight` counts outstanding per-replica sends: `send` adds the fan-out of
/// a task before queueing it and every per-replica completion subtracts one.
/// A failed send seals the replica.
pub struct Replicator {
    inner: Arc<ReplicatorInner>,
    tx: mpsc::Sender<ReplicateTask>,
    running: tokio::sync::RwLock<bool>,
    stopping: CancellationToken,
    dispatcher: Mutex<Option<Dispatcher>>,
}

struct Dispatcher {
    cancel: CancellationToken,
    handle: JoinHandle<mpsc::Receiver<ReplicateTask>>,
}

struct ReplicatorInner {
    log_stream_id: LogStreamId,
    factory: Arc<dyn ConnectorFactory>,
    connector: RwLock<Arc<dyn Connector>>,
    inflight: AtomicI64,
    drained: Notify,
    state: Arc<ExecutorState>,
}

impl Replicator {
    /// Spawns the dispatch loop; must be called inside a tokio runtime.
    pub fn start(
        log_stream_id: LogStreamId,
        capacity: usize,
        factory: Arc<dyn ConnectorFactory>,
        state: Arc<ExecutorState>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let inner = Arc::new(ReplicatorInner {
            log_stream_id,
            connector: RwLock::new(factory.connector()),
            factory,
            inflight: AtomicI64::new(0),
            drained: Notify::new(),
            state,
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(Arc::clone(&inner), rx, cancel.clone()));
        Self {
            inner,
            tx,
            running: tokio::sync::RwLock::new(true),
            stopping: CancellationToken::new(),
            dispatcher: Mutex::new(Some(Dispatcher { cancel, handle })),
        }
    }

    pub async fn send(&self, task: ReplicateTask) -> Result<(), ReplicationError> {
        let running = self.running.read().await;
        if !*running {
            return Err(ReplicationError::Stopped);
        }
        let fan_out = task.fan_out();
        self.inner.inflight.fetch_add(fan_out, Ordering::AcqRel);
        let queued = tokio::select! {
            _ = self.stopping.cancelled() => false,
            sent = self.tx.send(task) => sent.is_ok(),
        };
        drop(running);
        if !queued {
            self.inner.finish(fan_out);
            return Err(ReplicationError::Stopped);
        }
        Ok(())
    }

    pub fn inflight(&self) -> i64 {
        self.inner.inflight.load(Ordering::Acquire)
    }

    fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Waits until every queued send has completed. Returns `Ok` when the
    /// queue is empty even if `cancel` fired first.
    pub async fn wait_for_drainage(&self, cancel: &CancellationToken) -> Result<(), ReplicationError> {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.inflight.load(Ordering::Acquire) <= 0 {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut notified => {}
            }
        }
        if self.queued() == 0 {
            Ok(())
        } else {
            Err(ReplicationError::Cancelled)
        }
    }

    pub async fn client(&self, replica: &Replica) -> Result<Arc<dyn ReplicationClient>, ReplicationError> {
        let connector = self.inner.connector.read().clone();
        connector.get(replica).await
    }

    /// Swaps in a fresh connector and closes the old one.
    pub async fn reset_connector(&self) {
        let fresh = self.inner.factory.connector();
        let stale = std::mem::replace(&mut *self.inner.connector.write(), fresh);
        stale.close().await;
        debug!("event=replicator_reset_connector lsid={}", self.inner.log_stream_id);
    }

    /// Stops accepting work, cancels in-flight sends and forgets queued ones.
    pub async fn stop(&self) {
        self.stopping.cancel();
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.cancel.cancel();
            match dispatcher.handle.await {
                Ok(mut rx) => {
                    rx.close();
                    let mut dropped = 0;
                    while let Ok(task) = rx.try_recv() {
                        dropped += task.fan_out();
                    }
                    self.inner.finish(dropped);
                    if dropped > 0 {
                        debug!(
                            "event=replicator_dropped_queued lsid={} sends={dropped}",
                            self.inner.log_stream_id
                        );
                    }
                }
                Err(err) => warn!(
                    "event=replicator_dispatch_failed lsid={} error={err}",
                    self.inner.log_stream_id
                ),
            }
        }
        let connector = self.inner.connector.read().clone();
        connector.close().await;
    }
}

impl ReplicatorInner {
    fn finish(&self, sends: i64) {
        if sends == 0 {
            return;
        }
        self.inflight.fetch_sub(sends, Ordering::AcqRel);
        self.drained.notify_waiters();
    }

    fn on_replicated(&self, replica: &Replica, result: &Result<(), ReplicationError>) {
        if let Err(err) = result {
            if !matches!(err, ReplicationError::Cancelled) {
                self.state.set_sealing_with_reason(format!(
                    "replicate to storage node {} failed: {err}",
                    replica.storage_node_id
                ));
            }
        }
        self.finish(1);
    }

    async fn replicate(self: &Arc<Self>, task: ReplicateTask, cancel: &CancellationToken) {
        let group = cancel.child_token();
        let connector = self.connector.read().clone();
        let mut sends = JoinSet::new();
        for replica in task.replicas.iter().cloned() {
            let inner = Arc::clone(self);
            let connector = Arc::clone(&connector);
            let data = Arc::clone(&task.data);
            let group = group.clone();
            let first_llsn = task.first_llsn;
            sends.spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = group.cancelled() => Err(ReplicationError::Cancelled),
                    result = send_entries(connector, &replica, first_llsn, &data) => result,
                };
                inner.on_replicated(&replica, &result);
                result
            });
        }
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(_)) => group.cancel(),
                Err(err) => {
                    warn!(
                        "event=replicate_send_panicked lsid={} error={err}",
                        self.log_stream_id
                    );
                    self.state
                        .set_sealing_with_reason(format!("replicate send panicked: {err}"));
                    self.finish(1);
                    group.cancel();
                }
            }
        }
        trace!(
            "event=replicate_task_done lsid={} llsn={} entries={} elapsed_us={}",
            self.log_stream_id,
            task.first_llsn,
            task.len(),
            task.created_at.elapsed().as_micros()
        );
    }
}

async fn send_entries(
    connector: Arc<dyn Connector>,
    replica: &Replica,
    first_llsn: Llsn,
    data: &[Vec<u8>],
) -> Result<(), ReplicationError> {
    let client = connector.get(replica).await?;
    for (offset, payload) in data.iter().enumerate() {
        client.replicate(first_llsn + offset as u64, payload.clone()).await?;
    }
    Ok(())
}

async fn dispatch_loop(
    inner: Arc<ReplicatorInner>,
    mut rx: mpsc::Receiver<ReplicateTask>,
    cancel: CancellationToken,
) -> mpsc::Receiver<ReplicateTask> {
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        inner.replicate(task, &cancel).await;
    }
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{LogStreamStatus, SyncPayload, SyncPosition, SyncRange};
    use crate::replication::{LocalReplicationNetwork, ReplicationHandler};
    use crate::types::{StorageNodeId, TopicId};
    use async_trait::async_trait;
    use std::sync::Weak;
    use std::time::Duration;

    #[derive(Default)]
    struct Backup {
        received: Mutex<Vec<Llsn>>,
        hold: Notify,
        blocking: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ReplicationHandler for Backup {
        async fn handle_replicate(&self, llsn: Llsn, _data: Vec<u8>) -> Result<(), ReplicationError> {
            if self.blocking.load(Ordering::Acquire) {
                self.hold.notified().await;
            }
            self.received.lock().push(llsn);
            Ok(())
        }

        async fn handle_sync_init(
            &self,
            _source: &Replica,
            _range: SyncRange,
        ) -> Result<SyncPosition, ReplicationError> {
            Ok(SyncPosition::default())
        }

        async fn handle_sync_replicate(
            &self,
            _source: &Replica,
            _payload: SyncPayload,
        ) -> Result<(), ReplicationError> {
            Ok(())
        }
    }

    fn backup_replica(sn: i32) -> Replica {
        Replica::new(StorageNodeId(sn), TopicId(1), LogStreamId(1), format!("sn-{sn}"))
    }

    fn setup(network: &LocalReplicationNetwork) -> (Replicator, Arc<ExecutorState>) {
        let state = Arc::new(ExecutorState::new(LogStreamStatus::Running));
        let factory: Arc<dyn ConnectorFactory> = Arc::new(network.clone());
        let replicator = Replicator::start(LogStreamId(1), 8, factory, Arc::clone(&state));
        (replicator, state)
    }

    #[tokio::test]
    async fn drains_after_all_backups_ack() {
        let network = LocalReplicationNetwork::new();
        let backups: Vec<Arc<Backup>> = (2..=3).map(|_| Arc::new(Backup::default())).collect();
        for (sn, backup) in (2..=3).zip(&backups) {
            network.register(
                StorageNodeId(sn),
                LogStreamId(1),
                Arc::downgrade(backup) as Weak<dyn ReplicationHandler>,
            );
        }
        let (replicator, state) = setup(&network);
        let task = ReplicateTask::new(
            Llsn(1),
            vec![b"a".to_vec(), b"b".to_vec()],
            vec![backup_replica(2), backup_replica(3)],
        );
        replicator.send(task).await.unwrap();
        replicator
            .wait_for_drainage(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(replicator.inflight(), 0);
        assert_eq!(state.status(), LogStreamStatus::Running);
        for backup in &backups {
            assert_eq!(*backup.received.lock(), vec![Llsn(1), Llsn(2)]);
        }
        replicator.stop().await;
    }

    #[tokio::test]
    async fn unreachable_backup_seals_replica() {
        let network = LocalReplicationNetwork::new();
        let (replicator, state) = setup(&network);
        replicator
            .send(ReplicateTask::new(Llsn(1), vec![b"a".to_vec()], vec![backup_replica(9)]))
            .await
            .unwrap();
        replicator
            .wait_for_drainage(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status(), LogStreamStatus::Sealing);
        assert!(state.seal_reason().unwrap().contains("storage node 9"));
        replicator.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_inflight_and_rejects_sends() {
        let network = LocalReplicationNetwork::new();
        let backup = Arc::new(Backup::default());
        backup.blocking.store(true, Ordering::Release);
        network.register(
            StorageNodeId(2),
            LogStreamId(1),
            Arc::downgrade(&backup) as Weak<dyn ReplicationHandler>,
        );
        let (replicator, _state) = setup(&network);
        for llsn in 1..=3 {
            replicator
                .send(ReplicateTask::new(Llsn(llsn), vec![Vec::new()], vec![backup_replica(2)]))
                .await
                .unwrap();
        }
        assert_eq!(replicator.inflight(), 3);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            replicator.wait_for_drainage(&cancel).await,
            Err(ReplicationError::Cancelled)
        );

        tokio::time::timeout(Duration::from_secs(5), replicator.stop())
            .await
            .unwrap();
        assert_eq!(replicator.inflight(), 0);
        assert_eq!(
            replicator
                .send(ReplicateTask::new(Llsn(4), vec![Vec::new()], vec![backup_replica(2)]))
                .await,
            Err(ReplicationError::Stopped)
        );
    }
}
