use crate::metarepos::config::MetadataRepositoryConfig;
use crate::metarepos::error::{MetadataError, RepositoryError};
use crate::metarepos::reporter::{ReporterConnector, ReporterError, ReporterPool};
use crate::metarepos::request::{ApplyOutput, ApplyResult, Request, RequestEnvelope};
use crate::metarepos::request_map::RequestMap;
use crate::metarepos::state::RepositoryState;
use crate::proto::{
    ClusterInfo, LogStreamDescriptor, MetadataDescriptor, StorageNodeDescriptor,
    StorageNodeUncommitReport,
};
use crate::raft::{
    ConfChange, ConfChangeKind, LocalRaftNetwork, Membership, RaftEntry, RaftError,
    RaftMessageHandler, RaftNode, RaftStateMachine, RaftTransport, Snapshot,
};
use crate::types::{Glsn, LogStreamId, NodeId, StorageNodeId, TopicId};
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Feeds committed raft entries into [`RepositoryState`] and wakes the
/// proposers waiting on them.
struct ReplicatedState {
    state: RwLock<RepositoryState>,
    requests: Arc<RequestMap>,
    applied: watch::Sender<u64>,
}

impl ReplicatedState {
    fn read<T>(&self, f: impl FnOnce(&RepositoryState) -> T) -> T {
        f(&self.state.read())
    }

    fn apply_request(&self, index: u64, request: &Request) -> ApplyResult {
        let result = {
            let mut state = self.state.write();
            let result = state.apply(request);
            state.set_applied_index(index);
            result
        };
        self.applied.send_replace(index);
        result
    }
}

impl RaftStateMachine for ReplicatedState {
    fn apply(&self, entry: &RaftEntry) {
        let envelope: RequestEnvelope = match serde_json::from_slice(&entry.data) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!("event=mr_entry_decode_failed index={} error={err}", entry.index);
                self.state.write().set_applied_index(entry.index);
                self.applied.send_replace(entry.index);
                return;
            }
        };
        trace!(
            "event=mr_apply index={} request={} node={} request_id={}",
            entry.index,
            envelope.body.name(),
            envelope.node_index,
            envelope.request_id
        );
        let result = self.apply_request(entry.index, &envelope.body);
        self.requests
            .complete(envelope.node_index, envelope.request_id, result);
    }

    fn apply_conf_change(&self, index: u64, change: &ConfChange, membership: &Membership) {
        let request = match change.kind {
            ConfChangeKind::AddNode | ConfChangeKind::AddLearner => Request::AddPeer {
                node_id: change.node_id,
                url: membership
                    .url(change.node_id)
                    .map(str::to_string)
                    .unwrap_or_else(|| change.url.clone()),
                learner: change.kind == ConfChangeKind::AddLearner,
            },
            ConfChangeKind::RemoveNode => Request::RemovePeer {
                node_id: change.node_id,
            },
        };
        if let Err(err) = self.apply_request(index, &request) {
            debug!("event=mr_peer_change_skipped index={index} error={err}");
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, RaftError> {
        Ok(serde_json::to_vec(&*self.state.read())?)
    }

    fn restore(&self, snapshot: &Snapshot) -> Result<(), RaftError> {
        let mut restored: RepositoryState = serde_json::from_slice(&snapshot.data)?;
        restored.set_applied_index(snapshot.index());
        *self.state.write() = restored;
        self.applied.send_replace(snapshot.index());
        Ok(())
    }
}

/// Holds a storage node's push slot; at most one commit push per node is in
/// flight.
struct PushSlot {
    in_flight: Arc<Mutex<HashSet<StorageNodeId>>>,
    storage_node_id: StorageNodeId,
}

impl PushSlot {
    fn acquire(
        in_flight: &Arc<Mutex<HashSet<StorageNodeId>>>,
        storage_node_id: StorageNodeId,
    ) -> Option<Self> {
        if !in_flight.lock().insert(storage_node_id) {
            return None;
        }
        Some(Self {
            in_flight: Arc::clone(in_flight),
            storage_node_id,
        })
    }
}

impl Drop for PushSlot {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.storage_node_id);
    }
}

/// One member of the metadata repository. Every member serves reads from
/// its applied state; the elected leader also drives report collection,
/// global commits and commit pushes.
pub struct MetadataRepository {
    config: MetadataRepositoryConfig,
    node_id: NodeId,
    raft: Arc<RaftNode>,
    machine: Arc<ReplicatedState>,
    requests: Arc<RequestMap>,
    reporters: Arc<ReporterPool>,
    report_cache: Mutex<BTreeMap<StorageNodeId, StorageNodeUncommitReport>>,
    pushes: Arc<Mutex<HashSet<StorageNodeId>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MetadataRepository {
    /// Opens the raft state under `config.raft.data_dir` and starts the
    /// commit loop. Must be called inside a tokio runtime.
    pub fn start(
        config: MetadataRepositoryConfig,
        transport: Arc<dyn RaftTransport>,
        connector: Arc<dyn ReporterConnector>,
    ) -> Result<Arc<Self>, RepositoryError> {
        config.validate()?;
        let node_id = config.node_id();
        let requests = RequestMap::new(node_id);
        let (applied, _) = watch::channel(0);
        let machine = Arc::new(ReplicatedState {
            state: RwLock::new(RepositoryState::new(config.replication_factor)),
            requests: Arc::clone(&requests),
            applied,
        });
        let raft = RaftNode::start(config.raft.clone(), transport, machine.clone())?;
        let repository = Arc::new(Self {
            node_id,
            raft,
            machine,
            requests,
            reporters: Arc::new(ReporterPool::new(connector)),
            report_cache: Mutex::new(BTreeMap::new()),
            pushes: Arc::new(Mutex::new(HashSet::new())),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        });
        let commit_loop = tokio::spawn(Arc::clone(&repository).run_commit_loop());
        repository.tasks.lock().push(commit_loop);
        info!(
            "event=mr_started cluster_id={} node_id={node_id} replication_factor={}",
            repository.config.cluster_id, repository.config.replication_factor
        );
        Ok(repository)
    }

    /// Starts a member wired into an in-process raft network.
    pub fn start_local(
        config: MetadataRepositoryConfig,
        network: &LocalRaftNetwork,
        connector: Arc<dyn ReporterConnector>,
    ) -> Result<Arc<Self>, RepositoryError> {
        let node_id = config.node_id();
        let repository = Self::start(config, network.transport(node_id), connector)?;
        let handler: Arc<dyn RaftMessageHandler> = repository.raft.clone();
        network.register(node_id, Arc::downgrade(&handler));
        Ok(repository)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.raft.leader()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub async fn register_storage_node(
        &self,
        storage_node: StorageNodeDescriptor,
    ) -> Result<(), RepositoryError> {
        self.propose(Request::RegisterStorageNode { storage_node })
            .await
            .map(drop)
    }

    pub async fn unregister_storage_node(
        &self,
        storage_node_id: StorageNodeId,
    ) -> Result<(), RepositoryError> {
        self.propose(Request::UnregisterStorageNode { storage_node_id })
            .await
            .map(drop)
    }

    pub async fn register_topic(&self, topic_id: TopicId) -> Result<(), RepositoryError> {
        self.propose(Request::RegisterTopic { topic_id })
            .await
            .map(drop)
    }

    pub async fn unregister_topic(&self, topic_id: TopicId) -> Result<(), RepositoryError> {
        self.propose(Request::UnregisterTopic { topic_id })
            .await
            .map(drop)
    }

    pub async fn register_log_stream(
        &self,
        log_stream: LogStreamDescriptor,
    ) -> Result<(), RepositoryError> {
        self.propose(Request::RegisterLogStream { log_stream })
            .await
            .map(drop)
    }

    pub async fn unregister_log_stream(
        &self,
        log_stream_id: LogStreamId,
    ) -> Result<(), RepositoryError> {
        self.propose(Request::UnregisterLogStream { log_stream_id })
            .await
            .map(drop)
    }

    pub async fn update_log_stream(
        &self,
        log_stream: LogStreamDescriptor,
    ) -> Result<(), RepositoryError> {
        self.propose(Request::UpdateLogStream { log_stream })
            .await
            .map(drop)
    }

    /// Seals the log stream and returns its last committed GLSN.
    pub async fn seal(&self, log_stream_id: LogStreamId) -> Result<Glsn, RepositoryError> {
        match self.propose(Request::Seal { log_stream_id }).await? {
            ApplyOutput::LastCommitted(glsn) => Ok(glsn),
            ApplyOutput::Done => Ok(self.get_last_committed(log_stream_id)),
        }
    }

    pub async fn unseal(&self, log_stream_id: LogStreamId) -> Result<(), RepositoryError> {
        self.propose(Request::Unseal { log_stream_id })
            .await
            .map(drop)
    }

    /// Proposes storage-node reports directly, bypassing the reporter pool.
    pub async fn propose_report(
        &self,
        reports: Vec<StorageNodeUncommitReport>,
    ) -> Result<(), RepositoryError> {
        self.propose(Request::Report { reports }).await.map(drop)
    }

    /// Runs a global commit round now instead of waiting for the tick.
    pub async fn propose_commit(&self) -> Result<(), RepositoryError> {
        self.propose(Request::Commit).await.map(drop)
    }

    /// Adds a raft member, or promotes a learner when `learner` is false.
    pub async fn add_peer(
        &self,
        node_id: NodeId,
        url: impl Into<String>,
        learner: bool,
    ) -> Result<(), RepositoryError> {
        let membership = self.raft.membership();
        let already = if learner {
            membership.contains(node_id)
        } else {
            membership.is_voter(node_id)
        };
        if already {
            return Err(MetadataError::AlreadyExists(format!("peer {node_id}")).into());
        }
        let url = url.into();
        let change = if learner {
            ConfChange::add_learner(node_id, url)
        } else {
            ConfChange::add_node(node_id, url)
        };
        self.change_membership(change).await
    }

    pub async fn remove_peer(&self, node_id: NodeId) -> Result<(), RepositoryError> {
        if !self.raft.membership().contains(node_id) {
            return Err(MetadataError::NotFound(format!("peer {node_id}")).into());
        }
        self.change_membership(ConfChange::remove_node(node_id))
            .await
    }

    pub fn get_metadata(&self) -> MetadataDescriptor {
        self.machine.read(|state| state.metadata().clone())
    }

    pub fn get_cluster_info(&self) -> ClusterInfo {
        let status = self.raft.status();
        self.machine.read(|state| ClusterInfo {
            cluster_id: self.config.cluster_id,
            node_id: self.node_id,
            leader: status.leader,
            replication_factor: state.replication_factor(),
            members: state.members().clone(),
            applied_index: status.applied_index,
            version: state.version(),
            high_watermark: state.high_watermark(),
        })
    }

    pub fn get_last_committed(&self, log_stream_id: LogStreamId) -> Glsn {
        self.machine.read(|state| state.last_committed(log_stream_id))
    }

    pub fn high_watermark(&self) -> Glsn {
        self.machine.read(RepositoryState::high_watermark)
    }

    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.raft.stop().await;
        info!("event=mr_stopped node_id={}", self.node_id);
    }

    /// Proposes `body` and waits until this member applied it. A timeout
    /// leaves the outcome unknown: the entry may still be applied later.
    async fn propose(&self, body: Request) -> Result<ApplyOutput, RepositoryError> {
        if self.shutdown.is_cancelled() {
            return Err(RepositoryError::Stopped);
        }
        let deadline = tokio::time::Instant::now() + self.config.propose_timeout;
        let mut pending = self.requests.register();
        let name = body.name();
        let envelope = RequestEnvelope {
            node_index: self.node_id,
            request_id: pending.request_id(),
            body,
        };
        let data = serde_json::to_vec(&envelope)?;
        let index = self
            .propose_with_retry(|| self.raft.propose(data.clone()))
            .await?;
        trace!(
            "event=mr_proposed node_id={} request={name} request_id={} index={index}",
            self.node_id,
            pending.request_id()
        );
        match tokio::time::timeout_at(deadline, pending.wait()).await {
            Ok(Some(result)) => Ok(result?),
            Ok(None) => Err(RepositoryError::Stopped),
            Err(_) => {
                warn!(
                    "event=mr_propose_timeout node_id={} request={name} index={index}",
                    self.node_id
                );
                Err(RepositoryError::Timeout)
            }
        }
    }

    async fn change_membership(&self, change: ConfChange) -> Result<(), RepositoryError> {
        let deadline = tokio::time::Instant::now() + self.config.propose_timeout;
        let index = self
            .propose_with_retry(|| self.raft.propose_conf_change(change.clone()))
            .await?;
        info!(
            "event=mr_membership_proposed node_id={} kind={:?} peer={} index={index}",
            self.node_id, change.kind, change.node_id
        );
        let mut applied = self.machine.applied.subscribe();
        let result = match tokio::time::timeout_at(
            deadline,
            applied.wait_for(|applied| *applied >= index),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(RepositoryError::Stopped),
            Err(_) => Err(RepositoryError::Timeout),
        };
        result
    }

    /// Retries while the cluster has no reachable leader.
    async fn propose_with_retry<F, Fut>(&self, mut submit: F) -> Result<u64, RepositoryError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<u64, RaftError>>,
    {
        let outcome = self
            .config
            .propose_retry()
            .run(&self.shutdown, |_| {
                let submitted = submit();
                async move {
                    match submitted.await {
                        Err(err) if err.is_retryable() => Err(err),
                        other => Ok(other),
                    }
                }
            })
            .await;
        match outcome {
            Ok(result) => Ok(result?),
            Err(err) => Err(err.into()),
        }
    }

    async fn run_commit_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.commit_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.raft.is_leader() {
                self.report_cache.lock().clear();
                continue;
            }
            if let Err(err) = self.commit_round().await {
                debug!("event=mr_commit_round_failed node_id={} error={err}", self.node_id);
            }
        }
    }

    /// One leader tick: collect reports, propose what changed, commit, then
    /// push results to the storage nodes that are behind.
    async fn commit_round(&self) -> Result<(), RepositoryError> {
        let nodes: Vec<StorageNodeDescriptor> = self
            .machine
            .read(|state| state.metadata().storage_nodes.values().cloned().collect());
        let registered: BTreeSet<_> = nodes.iter().map(|node| node.storage_node_id).collect();
        self.reporters.retain(&registered);
        self.report_cache
            .lock()
            .retain(|snid, _| registered.contains(snid));

        let reports = self.collect_reports(&nodes).await;
        let changed: Vec<_> = {
            let cache = self.report_cache.lock();
            reports
                .into_iter()
                .filter(|report| cache.get(&report.storage_node_id) != Some(report))
                .collect()
        };
        if !changed.is_empty() {
            self.propose(Request::Report {
                reports: changed.clone(),
            })
            .await?;
            let mut cache = self.report_cache.lock();
            for report in changed {
                cache.insert(report.storage_node_id, report);
            }
        }
        if self.machine.read(RepositoryState::would_commit) {
            self.propose(Request::Commit).await?;
        }
        self.push_commits(nodes);
        Ok(())
    }

    async fn collect_reports(&self, nodes: &[StorageNodeDescriptor]) -> Vec<StorageNodeUncommitReport> {
        let timeout = self.config.propose_timeout;
        let mut calls = JoinSet::new();
        for node in nodes {
            let node = node.clone();
            let reporters = Arc::clone(&self.reporters);
            calls.spawn(async move {
                let fetched = tokio::time::timeout(timeout, async {
                    let client = reporters.client(&node).await?;
                    client.get_report().await
                })
                .await
                .unwrap_or_else(|_| {
                    Err(ReporterError::Unreachable(
                        node.storage_node_id,
                        "report timed out".into(),
                    ))
                });
                (node.storage_node_id, fetched)
            });
        }
        let mut reports = Vec::with_capacity(nodes.len());
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((_, Ok(report))) => reports.push(report),
                Ok((snid, Err(err))) => {
                    debug!("event=mr_report_failed snid={snid} error={err}");
                    self.reporters.invalidate(snid);
                }
                Err(err) => error!("event=mr_report_task_failed error={err}"),
            }
        }
        reports.sort_by_key(|report| report.storage_node_id);
        reports
    }

    fn push_commits(&self, nodes: Vec<StorageNodeDescriptor>) {
        for node in nodes {
            let snid = node.storage_node_id;
            let results = self.machine.read(|state| state.commit_results_for(snid));
            if results.is_empty() {
                continue;
            }
            let Some(slot) = PushSlot::acquire(&self.pushes, snid) else {
                trace!("event=mr_push_skipped snid={snid} reason=in_flight");
                continue;
            };
            let reporters = Arc::clone(&self.reporters);
            let policy = self.config.push_retry();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let _slot = slot;
                let pushed = policy
                    .run(&shutdown, |attempt| {
                        let reporters = Arc::clone(&reporters);
                        let node = node.clone();
                        let results = results.clone();
                        async move {
                            let client = reporters.client(&node).await?;
                            client.commit(results).await.inspect_err(|err| {
                                trace!(
                                    "event=mr_push_retry snid={} attempt={attempt} error={err}",
                                    node.storage_node_id
                                );
                                reporters.invalidate(node.storage_node_id);
                            })
                        }
                    })
                    .await;
                if let Err(err) = pushed {
                    warn!("event=mr_push_failed snid={snid} error={err}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ReplicaDescriptor;
    use crate::types::ClusterId;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Unreachable;

    #[async_trait]
    impl ReporterConnector for Unreachable {
        async fn connect(
            &self,
            node: &StorageNodeDescriptor,
        ) -> Result<Arc<dyn crate::metarepos::reporter::ReporterClient>, ReporterError> {
            Err(ReporterError::Unreachable(node.storage_node_id, "test".into()))
        }
    }

    async fn single_member(dir: &TempDir) -> (LocalRaftNetwork, Arc<MetadataRepository>) {
        let network = LocalRaftNetwork::new();
        let mut config = MetadataRepositoryConfig::new(
            ClusterId::new(1),
            NodeId::new(1),
            "mr-1",
            dir.path(),
        )
        .with_replication_factor(1);
        config.raft = config
            .raft
            .with_election_timeout(Duration::from_millis(100), Duration::from_millis(200));
        let repository =
            MetadataRepository::start_local(config, &network, Arc::new(Unreachable)).unwrap();
        for _ in 0..200 {
            if repository.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(repository.is_leader());
        (network, repository)
    }

    #[tokio::test]
    async fn proposals_are_applied_and_rejections_surface() {
        let dir = TempDir::new().unwrap();
        let (_network, repository) = single_member(&dir).await;
        repository
            .register_storage_node(StorageNodeDescriptor::new(StorageNodeId::new(1), "sn-1"))
            .await
            .unwrap();
        let err = repository
            .register_storage_node(StorageNodeDescriptor::new(StorageNodeId::new(1), "sn-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Metadata(MetadataError::AlreadyExists(_))
        ));

        repository.register_topic(TopicId::new(1)).await.unwrap();
        repository
            .register_log_stream(LogStreamDescriptor::new(
                TopicId::new(1),
                LogStreamId::new(1),
                vec![ReplicaDescriptor::new(StorageNodeId::new(1), "/data")],
            ))
            .await
            .unwrap();
        assert_eq!(
            repository.seal(LogStreamId::new(1)).await.unwrap(),
            Glsn::INVALID
        );
        assert!(repository
            .seal(LogStreamId::new(7))
            .await
            .unwrap_err()
            .is_not_found());

        let info = repository.get_cluster_info();
        assert_eq!(info.leader, Some(NodeId::new(1)));
        assert!(info.members.contains_key(&NodeId::new(1)));
        assert_eq!(repository.get_metadata().log_streams.len(), 1);
        assert!(repository.requests.is_empty());
        repository.stop().await;
        assert!(matches!(
            repository.register_topic(TopicId::new(2)).await,
            Err(RepositoryError::Stopped)
        ));
    }
}
