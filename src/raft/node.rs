use crate::raft::config::RaftConfig;
use crate::raft::engine::{ApplyWork, Outbound, RaftCore, RaftStatus};
use crate::raft::error::RaftError;
use crate::raft::log_store::{EntryKind, RaftEntry};
use crate::raft::membership::{ConfChange, Membership};
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    ProposeRequest, ProposedEntry, RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::snapshot::Snapshot;
use crate::raft::transport::{RaftMessageHandler, RaftTransport};
use crate::types::NodeId;
use log::{debug, error, info, trace};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const MAX_APPLY_BATCH: usize = 128;

/// Replicated state fed by committed entries, in log order, from a single
/// apply task.
pub trait RaftStateMachine: Send + Sync {
    fn apply(&self, entry: &RaftEntry);

    /// Called once the membership change at `index` took effect.
    fn apply_conf_change(&self, index: u64, change: &ConfChange, membership: &Membership);

    fn snapshot(&self) -> Result<Vec<u8>, RaftError>;

    fn restore(&self, snapshot: &Snapshot) -> Result<(), RaftError>;
}

/// A raft member: the core state guarded by a mutex plus the tasks that
/// tick it, deliver its messages and apply committed entries.
pub struct RaftNode {
    id: NodeId,
    core: Mutex<RaftCore>,
    transport: Arc<dyn RaftTransport>,
    state_machine: Arc<dyn RaftStateMachine>,
    apply_notify: Notify,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    this: Weak<RaftNode>,
}

impl RaftNode {
    /// Opens the persistent state under `config.data_dir` and starts the
    /// ticker and apply tasks. Must be called inside a tokio runtime.
    pub fn start(
        config: RaftConfig,
        transport: Arc<dyn RaftTransport>,
        state_machine: Arc<dyn RaftStateMachine>,
    ) -> Result<Arc<Self>, RaftError> {
        let tick_interval = config.tick_interval;
        let core = RaftCore::open(config, Instant::now())?;
        let node = Arc::new_cyclic(|this| Self {
            id: core.id(),
            core: Mutex::new(core),
            transport,
            state_machine,
            apply_notify: Notify::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            this: this.clone(),
        });
        let ticker = tokio::spawn(Arc::clone(&node).run_ticker(tick_interval));
        let applier = tokio::spawn(Arc::clone(&node).run_apply());
        node.tasks.lock().extend([ticker, applier]);
        node.apply_notify.notify_one();
        info!("event=raft_node_started node_id={}", node.id);
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn status(&self) -> RaftStatus {
        self.core.lock().status()
    }

    pub fn is_leader(&self) -> bool {
        self.core.lock().leader() == Some(self.id)
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.core.lock().leader()
    }

    pub fn membership(&self) -> Membership {
        self.core.lock().membership().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Proposes opaque data. Followers forward to the leader they know.
    /// Returns the log index assigned to the entry.
    pub async fn propose(&self, data: Vec<u8>) -> Result<u64, RaftError> {
        self.submit(ProposedEntry::Normal { data }).await
    }

    pub async fn propose_conf_change(&self, change: ConfChange) -> Result<u64, RaftError> {
        self.submit(ProposedEntry::ConfChange { change }).await
    }

    async fn submit(&self, entry: ProposedEntry) -> Result<u64, RaftError> {
        if self.is_stopped() {
            return Err(RaftError::Stopped);
        }
        let local = self.core.lock().propose(entry.clone(), Instant::now());
        match local {
            Ok((index, outbound)) => {
                self.apply_notify.notify_one();
                self.dispatch(outbound);
                Ok(index)
            }
            Err(RaftError::NotLeader {
                leader: Some(leader),
            }) if leader != self.id => {
                trace!("event=raft_propose_forward node_id={} leader={leader}", self.id);
                self.transport
                    .propose(
                        leader,
                        ProposeRequest {
                            from: self.id,
                            entry,
                        },
                    )
                    .await
            }
            Err(err) => Err(err),
        }
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
        info!("event=raft_node_stopped node_id={}", self.id);
    }

    fn dispatch(&self, outbound: Vec<Outbound>) {
        if outbound.is_empty() || self.shutdown.is_cancelled() {
            return;
        }
        let Some(node) = self.this.upgrade() else {
            return;
        };
        for message in outbound {
            tokio::spawn(Arc::clone(&node).deliver(message));
        }
    }

    async fn deliver(self: Arc<Self>, message: Outbound) {
        let follow_up = match message {
            Outbound::RequestVote { to, request } => {
                match self.transport.request_vote(to, request).await {
                    Ok(response) => self.on_vote_response(to, response),
                    Err(err) => {
                        trace!("event=raft_send_failed node_id={} to={to} kind=vote error={err}", self.id);
                        Ok(Vec::new())
                    }
                }
            }
            Outbound::AppendEntries { to, request } => {
                match self.transport.append_entries(to, request).await {
                    Ok(response) => self.on_append_response(to, response),
                    Err(err) => {
                        trace!("event=raft_send_failed node_id={} to={to} kind=append error={err}", self.id);
                        self.core.lock().on_send_failure(to);
                        Ok(Vec::new())
                    }
                }
            }
            Outbound::InstallSnapshot { to, request } => {
                match self.transport.install_snapshot(to, request).await {
                    Ok(response) => self.on_snapshot_response(to, response),
                    Err(err) => {
                        debug!("event=raft_send_failed node_id={} to={to} kind=snapshot error={err}", self.id);
                        self.core.lock().on_send_failure(to);
                        Ok(Vec::new())
                    }
                }
            }
        };
        match follow_up {
            Ok(outbound) => {
                self.apply_notify.notify_one();
                self.dispatch(outbound);
            }
            Err(err) => error!("event=raft_response_failed node_id={} error={err}", self.id),
        }
    }

    fn on_vote_response(
        &self,
        from: NodeId,
        response: RequestVoteResponse,
    ) -> Result<Vec<Outbound>, RaftError> {
        self.core
            .lock()
            .on_vote_response(from, response, Instant::now())
    }

    fn on_append_response(
        &self,
        from: NodeId,
        response: AppendEntriesResponse,
    ) -> Result<Vec<Outbound>, RaftError> {
        self.core
            .lock()
            .on_append_response(from, response, Instant::now())
    }

    fn on_snapshot_response(
        &self,
        from: NodeId,
        response: InstallSnapshotResponse,
    ) -> Result<Vec<Outbound>, RaftError> {
        self.core
            .lock()
            .on_snapshot_response(from, response, Instant::now())
    }

    async fn run_ticker(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let outbound = self.core.lock().tick(Instant::now());
            match outbound {
                Ok(outbound) => {
                    if !outbound.is_empty() {
                        self.apply_notify.notify_one();
                    }
                    self.dispatch(outbound);
                }
                Err(err) => error!("event=raft_tick_failed node_id={} error={err}", self.id),
            }
        }
    }

    async fn run_apply(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.apply_notify.notified() => {}
            }
            loop {
                let work = self.core.lock().next_apply(MAX_APPLY_BATCH);
                match work {
                    ApplyWork::Idle => break,
                    ApplyWork::Snapshot(snapshot) => self.restore(&snapshot),
                    ApplyWork::Entries(entries) => {
                        for entry in &entries {
                            self.apply_entry(entry);
                        }
                    }
                }
                self.maybe_snapshot();
            }
        }
    }

    fn restore(&self, snapshot: &Snapshot) {
        if let Err(err) = self.state_machine.restore(snapshot) {
            error!(
                "event=raft_restore_failed node_id={} index={} error={err}",
                self.id,
                snapshot.index()
            );
            return;
        }
        self.core.lock().mark_snapshot_restored(snapshot);
        info!(
            "event=raft_snapshot_restored node_id={} index={}",
            self.id,
            snapshot.index()
        );
    }

    fn apply_entry(&self, entry: &RaftEntry) {
        match entry.kind {
            EntryKind::Normal => self.state_machine.apply(entry),
            EntryKind::Noop => {}
            EntryKind::ConfChange => match serde_json::from_slice::<ConfChange>(&entry.data) {
                Ok(change) => {
                    let applied = self.core.lock().apply_conf_change(&change, Instant::now());
                    match applied {
                        Ok((membership, outbound)) => {
                            self.state_machine
                                .apply_conf_change(entry.index, &change, &membership);
                            self.dispatch(outbound);
                        }
                        Err(err) => error!(
                            "event=raft_conf_change_failed node_id={} index={} error={err}",
                            self.id, entry.index
                        ),
                    }
                }
                Err(err) => error!(
                    "event=raft_conf_change_decode_failed node_id={} index={} error={err}",
                    self.id, entry.index
                ),
            },
        }
        self.core.lock().mark_applied(entry.index);
    }

    fn maybe_snapshot(&self) {
        let applied = {
            let core = self.core.lock();
            if !core.should_snapshot() {
                return;
            }
            core.applied_index()
        };
        let data = match self.state_machine.snapshot() {
            Ok(data) => data,
            Err(err) => {
                error!("event=raft_snapshot_failed node_id={} error={err}", self.id);
                return;
            }
        };
        if let Err(err) = self.core.lock().save_snapshot(applied, data) {
            error!("event=raft_snapshot_failed node_id={} error={err}", self.id);
        }
    }

    fn ensure_running(&self) -> Result<(), RaftError> {
        if self.shutdown.is_cancelled() {
            return Err(RaftError::Stopped);
        }
        Ok(())
    }
}

impl RaftMessageHandler for RaftNode {
    fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        self.ensure_running()?;
        self.core.lock().handle_request_vote(request, Instant::now())
    }

    fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        self.ensure_running()?;
        let response = self
            .core
            .lock()
            .handle_append_entries(request, Instant::now());
        self.apply_notify.notify_one();
        response
    }

    fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        self.ensure_running()?;
        let response = self
            .core
            .lock()
            .handle_install_snapshot(request, Instant::now());
        self.apply_notify.notify_one();
        response
    }

    fn handle_propose(&self, request: ProposeRequest) -> Result<u64, RaftError> {
        self.ensure_running()?;
        let proposed = self.core.lock().propose(request.entry, Instant::now());
        let (index, outbound) = proposed?;
        debug!(
            "event=raft_forwarded_proposal node_id={} from={} index={index}",
            self.id, request.from
        );
        self.apply_notify.notify_one();
        self.dispatch(outbound);
        Ok(index)
    }
}
