use crate::raft::append::AppendEntriesProcessor;
use crate::raft::config::RaftConfig;
use crate::raft::election::{CandidateState, ElectionController, ElectionTimer};
use crate::raft::error::RaftError;
use crate::raft::log_store::{
    EntryKind, HardState, HardStateStore, RaftEntry, RaftLogStore, TermIndex,
};
use crate::raft::membership::{ConfChange, Membership};
use crate::raft::quorum::{log_is_up_to_date, PartitionQuorum};
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    ProposedEntry, RequestVoteRejectReason, RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::snapshot::{Snapshot, SnapshotStore};
use crate::types::NodeId;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

/// A message the core wants sent. The runtime delivers it and feeds the
/// answer back through the matching `on_*` method.
#[derive(Debug, Clone)]
pub enum Outbound {
    RequestVote {
        to: NodeId,
        request: RequestVoteRequest,
    },
    AppendEntries {
        to: NodeId,
        request: AppendEntriesRequest,
    },
    InstallSnapshot {
        to: NodeId,
        request: InstallSnapshotRequest,
    },
}

/// Next unit of work for the apply loop.
#[derive(Debug)]
pub enum ApplyWork {
    Snapshot(Snapshot),
    Entries(Vec<RaftEntry>),
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub term: u64,
    pub role: Role,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub last_index: u64,
    pub snapshot_index: u64,
    pub membership: Membership,
}

/// How eagerly the leader contacts a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendMode {
    /// Only when entries are pending and nothing is in flight.
    Entries,
    /// Also when only the commit index moved.
    Commit,
    /// Always, even with a request in flight.
    Heartbeat,
}

#[derive(Debug, Clone, Copy)]
struct PeerProgress {
    next_index: u64,
    match_index: u64,
    inflight_since: Option<Instant>,
    last_ack: Instant,
}

/// Single-threaded raft state: roles, log matching, commit and membership.
/// It performs disk I/O but never networking; callers serialize access.
pub struct RaftCore {
    id: NodeId,
    config: RaftConfig,
    hard: HardState,
    hard_store: HardStateStore,
    log: RaftLogStore,
    snapshots: SnapshotStore,
    snapshot: Option<Snapshot>,
    pending_snapshot: Option<Snapshot>,
    membership: Membership,
    role: Role,
    leader: Option<NodeId>,
    last_leader_contact: Option<Instant>,
    quorum: Option<PartitionQuorum>,
    peers: HashMap<NodeId, PeerProgress>,
    candidate: Option<CandidateState>,
    election: ElectionController,
    timer: ElectionTimer,
    next_heartbeat: Instant,
    applied: u64,
    pending_conf_index: u64,
}

impl RaftCore {
    pub fn open(config: RaftConfig, now: Instant) -> Result<Self, RaftError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir).map_err(crate::raft::log_store::RaftLogError::from)?;
        let hard_store = HardStateStore::new(config.data_dir.join("hard_state.json"));
        let snapshots = SnapshotStore::new(config.data_dir.join("snapshot.json"));
        let mut hard = hard_store.load_or_default()?;
        let mut log = RaftLogStore::open(config.data_dir.join("raft.log"))?;
        let snapshot = snapshots.load()?;

        if let Some(snapshot) = &snapshot {
            if log.term_at(snapshot.index()) != Some(snapshot.term()) {
                log.reset(snapshot.last_included)?;
            }
            hard.commit = hard.commit.max(snapshot.index());
        }

        let fresh = log.last_index() == 0 && snapshot.is_none();
        if fresh && !config.join {
            // Every founding member writes the same bootstrap entries, so
            // their logs agree from the start.
            let entries = config
                .peers
                .iter()
                .enumerate()
                .map(|(i, (id, url))| {
                    let change = ConfChange::add_node(*id, url.clone());
                    serde_json::to_vec(&change)
                        .map(|data| RaftEntry::new(1, i as u64 + 1, EntryKind::ConfChange, data))
                })
                .collect::<Result<Vec<_>, _>>()?;
            log.append_batch(&entries)?;
            hard.term = hard.term.max(1);
            hard.commit = log.last_index();
            hard_store.persist(&hard)?;
            info!(
                "event=raft_bootstrap node_id={} voters={}",
                config.node_id,
                entries.len()
            );
        }

        let seed = config.node_id.get().wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ hard.term;
        let mut election =
            ElectionController::new(config.election_timeout_min, config.election_timeout_max, seed);
        let timer = ElectionTimer::new(now, election.next_election_timeout());
        let membership = snapshot
            .as_ref()
            .map(|snapshot| snapshot.membership.clone())
            .unwrap_or_default();
        let applied = snapshot.as_ref().map(Snapshot::index).unwrap_or(0);
        info!(
            "event=raft_open node_id={} term={} commit={} applied={applied} last_index={}",
            config.node_id,
            hard.term,
            hard.commit,
            log.last_index()
        );
        Ok(Self {
            id: config.node_id,
            hard,
            hard_store,
            log,
            snapshots,
            pending_snapshot: snapshot.clone(),
            snapshot,
            membership,
            role: Role::Follower,
            leader: None,
            last_leader_contact: None,
            quorum: None,
            peers: HashMap::new(),
            candidate: None,
            election,
            timer,
            next_heartbeat: now,
            applied,
            pending_conf_index: 0,
            config,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn term(&self) -> u64 {
        self.hard.term
    }

    pub fn commit_index(&self) -> u64 {
        self.hard.commit
    }

    pub fn applied_index(&self) -> u64 {
        self.applied
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            node_id: self.id,
            term: self.hard.term,
            role: self.role,
            leader: self.leader,
            commit_index: self.hard.commit,
            applied_index: self.applied,
            last_index: self.log.last_index(),
            snapshot_index: self.snapshot.as_ref().map(Snapshot::index).unwrap_or(0),
            membership: self.membership.clone(),
        }
    }

    fn max_election_timeout(&self) -> Duration {
        self.election.window().1
    }

    /// Drives elections, heartbeats and leader self-checks.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<Outbound>, RaftError> {
        match self.role {
            Role::Leader => {
                if !self.has_active_quorum(now) {
                    warn!(
                        "event=raft_step_down node_id={} term={} reason=lost_quorum",
                        self.id, self.hard.term
                    );
                    self.become_follower(self.hard.term, None, now)?;
                    return Ok(Vec::new());
                }
                if now < self.next_heartbeat {
                    return Ok(Vec::new());
                }
                self.next_heartbeat = now + self.config.heartbeat_interval;
                Ok(self.broadcast(now, SendMode::Heartbeat))
            }
            Role::Follower | Role::Candidate => {
                if !self.timer.expired(now) {
                    return Ok(Vec::new());
                }
                if !self.membership.is_voter(self.id) {
                    let timeout = self.election.next_election_timeout();
                    self.timer.reset(now, timeout);
                    return Ok(Vec::new());
                }
                self.campaign(now)
            }
        }
    }

    fn has_active_quorum(&self, now: Instant) -> bool {
        let window = self.max_election_timeout();
        let active = self
            .membership
            .voters
            .keys()
            .filter(|id| **id != self.id)
            .filter(|id| {
                self.peers
                    .get(*id)
                    .is_some_and(|peer| now.saturating_duration_since(peer.last_ack) <= window)
            })
            .count();
        let self_vote = usize::from(self.membership.is_voter(self.id));
        active + self_vote >= self.membership.voters.len() / 2 + 1
    }

    fn persist_hard_state(&self) -> Result<(), RaftError> {
        self.hard_store.persist(&self.hard)?;
        Ok(())
    }

    fn campaign(&mut self, now: Instant) -> Result<Vec<Outbound>, RaftError> {
        self.hard.term += 1;
        self.hard.voted_for = Some(self.id);
        self.persist_hard_state()?;
        self.role = Role::Candidate;
        self.leader = None;
        let candidate = self.election.spawn_candidate(self.id, self.hard.term, now);
        self.timer.reset(now, candidate.timer().timeout());
        info!(
            "event=raft_campaign node_id={} term={} last_index={} last_term={}",
            self.id,
            self.hard.term,
            self.log.last_index(),
            self.log.last_term()
        );
        let voters = self.membership.voter_ids();
        if candidate.votes_granted(&voters) >= voters.len() / 2 + 1 {
            self.candidate = Some(candidate);
            return self.become_leader(now);
        }
        self.candidate = Some(candidate);
        let request = RequestVoteRequest {
            term: self.hard.term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        Ok(voters
            .into_iter()
            .filter(|id| *id != self.id)
            .map(|to| Outbound::RequestVote {
                to,
                request: request.clone(),
            })
            .collect())
    }

    fn become_follower(
        &mut self,
        term: u64,
        leader: Option<NodeId>,
        now: Instant,
    ) -> Result<(), RaftError> {
        if term > self.hard.term {
            self.hard.term = term;
            self.hard.voted_for = None;
            self.persist_hard_state()?;
        }
        if self.role == Role::Leader {
            info!("event=raft_leader_lost node_id={} term={term}", self.id);
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.candidate = None;
        self.quorum = None;
        self.peers.clear();
        let timeout = self.election.next_election_timeout();
        self.timer.reset(now, timeout);
        Ok(())
    }

    fn become_leader(&mut self, now: Instant) -> Result<Vec<Outbound>, RaftError> {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.candidate = None;
        let next_index = self.log.last_index() + 1;
        self.peers = self
            .membership
            .peers_of(self.id)
            .into_iter()
            .map(|id| {
                let progress = PeerProgress {
                    next_index,
                    match_index: 0,
                    inflight_since: None,
                    last_ack: now,
                };
                (id, progress)
            })
            .collect();
        self.quorum = Some(PartitionQuorum::new(
            self.membership.voter_ids(),
            self.hard.commit,
        ));
        self.pending_conf_index = self.log.last_index();
        info!(
            "event=raft_leader_elected node_id={} term={} last_index={}",
            self.id,
            self.hard.term,
            self.log.last_index()
        );
        self.append_local(EntryKind::Noop, Vec::new())?;
        self.next_heartbeat = now + self.config.heartbeat_interval;
        Ok(self.broadcast(now, SendMode::Heartbeat))
    }

    fn append_local(&mut self, kind: EntryKind, data: Vec<u8>) -> Result<u64, RaftError> {
        let index = self.log.last_index() + 1;
        self.log
            .append(RaftEntry::new(self.hard.term, index, kind, data))?;
        if let Some(quorum) = self.quorum.as_mut() {
            if quorum.voters().contains(&self.id) {
                let _ = quorum.record_match(self.id, self.hard.term, index);
            }
        }
        self.maybe_advance_commit()?;
        Ok(index)
    }

    fn maybe_advance_commit(&mut self) -> Result<bool, RaftError> {
        let Some(quorum) = self.quorum.as_mut() else {
            return Ok(false);
        };
        let committed = quorum.advance_commit(self.hard.term);
        if committed > self.hard.commit {
            self.hard.commit = committed;
            self.persist_hard_state()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Appends a client proposal on the leader.
    pub fn propose(
        &mut self,
        entry: ProposedEntry,
        now: Instant,
    ) -> Result<(u64, Vec<Outbound>), RaftError> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader,
            });
        }
        let index = match entry {
            ProposedEntry::Normal { data } => self.append_local(EntryKind::Normal, data)?,
            ProposedEntry::ConfChange { change } => {
                if self.pending_conf_index > self.applied {
                    return Err(RaftError::ConfChangeInProgress);
                }
                let data = serde_json::to_vec(&change)?;
                let index = self.append_local(EntryKind::ConfChange, data)?;
                self.pending_conf_index = index;
                index
            }
        };
        Ok((index, self.broadcast(now, SendMode::Entries)))
    }

    fn broadcast(&mut self, now: Instant, mode: SendMode) -> Vec<Outbound> {
        let peers: Vec<NodeId> = self.peers.keys().copied().collect();
        peers
            .into_iter()
            .filter_map(|peer| self.replicate_to(peer, now, mode))
            .collect()
    }

    fn replicate_to(&mut self, peer: NodeId, now: Instant, mode: SendMode) -> Option<Outbound> {
        let stale_after = self.config.election_timeout_min;
        let progress = self.peers.get_mut(&peer)?;
        let inflight = progress
            .inflight_since
            .is_some_and(|since| now.saturating_duration_since(since) < stale_after);
        if inflight && mode != SendMode::Heartbeat {
            return None;
        }
        let last_index = self.log.last_index();
        let caught_up = progress.next_index > last_index && progress.match_index >= last_index;
        if caught_up && mode == SendMode::Entries {
            return None;
        }
        let prev_index = progress.next_index.saturating_sub(1);
        let prev_term = self.log.term_at(prev_index);
        let behind_snapshot = progress.next_index <= self.log.base().index || prev_term.is_none();
        if behind_snapshot {
            let snapshot = self.snapshot.as_ref()?;
            progress.inflight_since = Some(now);
            debug!(
                "event=raft_send_snapshot node_id={} to={peer} index={}",
                self.id,
                snapshot.index()
            );
            return Some(Outbound::InstallSnapshot {
                to: peer,
                request: InstallSnapshotRequest {
                    term: self.hard.term,
                    leader_id: self.id,
                    last_included_index: snapshot.index(),
                    last_included_term: snapshot.term(),
                    membership: snapshot.membership.clone(),
                    data: snapshot.data.clone(),
                },
            });
        }
        let entries = self.log.entries(
            progress.next_index,
            last_index,
            self.config.max_entries_per_append,
        );
        progress.inflight_since = Some(now);
        Some(Outbound::AppendEntries {
            to: peer,
            request: AppendEntriesRequest {
                term: self.hard.term,
                leader_id: self.id,
                prev_log_index: prev_index,
                prev_log_term: prev_term.unwrap_or(0),
                leader_commit: self.hard.commit,
                entries,
            },
        })
    }

    pub fn on_send_failure(&mut self, peer: NodeId) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.inflight_since = None;
        }
    }

    pub fn on_vote_response(
        &mut self,
        from: NodeId,
        response: RequestVoteResponse,
        now: Instant,
    ) -> Result<Vec<Outbound>, RaftError> {
        if response.term > self.hard.term {
            self.become_follower(response.term, None, now)?;
            return Ok(Vec::new());
        }
        if self.role != Role::Candidate {
            return Ok(Vec::new());
        }
        let voters = self.membership.voter_ids();
        let Some(candidate) = self.candidate.as_mut() else {
            return Ok(Vec::new());
        };
        if candidate.term() != self.hard.term || response.term != self.hard.term {
            return Ok(Vec::new());
        }
        candidate.record_vote(from, response.granted);
        if candidate.votes_granted(&voters) >= voters.len() / 2 + 1 {
            return self.become_leader(now);
        }
        Ok(Vec::new())
    }

    pub fn on_append_response(
        &mut self,
        from: NodeId,
        response: AppendEntriesResponse,
        now: Instant,
    ) -> Result<Vec<Outbound>, RaftError> {
        if response.term > self.hard.term {
            self.become_follower(response.term, None, now)?;
            return Ok(Vec::new());
        }
        if self.role != Role::Leader || response.term != self.hard.term {
            return Ok(Vec::new());
        }
        let Some(progress) = self.peers.get_mut(&from) else {
            return Ok(Vec::new());
        };
        progress.inflight_since = None;
        progress.last_ack = now;
        if response.success {
            progress.match_index = progress.match_index.max(response.match_index);
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            let matched = progress.match_index;
            let matched_term = self.log.term_at(matched).unwrap_or(0);
            if let Some(quorum) = self.quorum.as_mut() {
                if quorum.voters().contains(&from) {
                    let _ = quorum.record_match(from, matched_term, matched);
                }
            }
            if self.maybe_advance_commit()? {
                return Ok(self.broadcast(now, SendMode::Commit));
            }
        } else {
            let hint = response
                .conflict_index
                .unwrap_or(progress.next_index.saturating_sub(1));
            progress.next_index = progress
                .next_index
                .saturating_sub(1)
                .min(hint)
                .max(progress.match_index + 1)
                .max(1);
            debug!(
                "event=raft_append_rejected node_id={} from={from} next_index={}",
                self.id, progress.next_index
            );
        }
        Ok(self.replicate_to(from, now, SendMode::Entries).into_iter().collect())
    }

    pub fn on_snapshot_response(
        &mut self,
        from: NodeId,
        response: InstallSnapshotResponse,
        now: Instant,
    ) -> Result<Vec<Outbound>, RaftError> {
        self.on_append_response(
            from,
            AppendEntriesResponse {
                term: response.term,
                success: true,
                match_index: response.match_index,
                conflict_index: None,
                conflict_term: None,
            },
            now,
        )
    }

    pub fn handle_request_vote(
        &mut self,
        request: RequestVoteRequest,
        now: Instant,
    ) -> Result<RequestVoteResponse, RaftError> {
        if request.term < self.hard.term {
            return Ok(RequestVoteResponse::rejected(
                self.hard.term,
                RequestVoteRejectReason::TermOutOfDate,
            ));
        }
        // A live leader keeps its lease; rejoining members cannot depose it.
        let leader_active = self.role == Role::Leader
            || self.last_leader_contact.is_some_and(|contact| {
                self.leader.is_some()
                    && now.saturating_duration_since(contact) < self.config.election_timeout_min
            });
        if request.term > self.hard.term && leader_active {
            return Ok(RequestVoteResponse::rejected(
                self.hard.term,
                RequestVoteRejectReason::LeaderActive,
            ));
        }
        if request.term > self.hard.term {
            self.become_follower(request.term, None, now)?;
        }
        if self
            .hard
            .voted_for
            .is_some_and(|voted| voted != request.candidate_id)
        {
            return Ok(RequestVoteResponse::rejected(
                self.hard.term,
                RequestVoteRejectReason::AlreadyVoted,
            ));
        }
        if !log_is_up_to_date(
            request.last_log_term,
            request.last_log_index,
            self.log.last_term(),
            self.log.last_index(),
        ) {
            return Ok(RequestVoteResponse::rejected(
                self.hard.term,
                RequestVoteRejectReason::LogBehind,
            ));
        }
        self.hard.voted_for = Some(request.candidate_id);
        self.persist_hard_state()?;
        let timeout = self.election.next_election_timeout();
        self.timer.reset(now, timeout);
        debug!(
            "event=raft_vote_granted node_id={} candidate={} term={}",
            self.id, request.candidate_id, self.hard.term
        );
        Ok(RequestVoteResponse::granted(self.hard.term))
    }

    fn accept_leader(&mut self, term: u64, leader: NodeId, now: Instant) -> Result<(), RaftError> {
        if term > self.hard.term || self.role != Role::Follower {
            self.become_follower(term, Some(leader), now)?;
        }
        if self.leader != Some(leader) {
            info!(
                "event=raft_leader_observed node_id={} leader={leader} term={term}",
                self.id
            );
        }
        self.leader = Some(leader);
        self.last_leader_contact = Some(now);
        let timeout = self.election.next_election_timeout();
        self.timer.reset(now, timeout);
        Ok(())
    }

    pub fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
        now: Instant,
    ) -> Result<AppendEntriesResponse, RaftError> {
        if request.term < self.hard.term {
            return Ok(AppendEntriesResponse {
                term: self.hard.term,
                success: false,
                match_index: 0,
                conflict_index: None,
                conflict_term: None,
            });
        }
        self.accept_leader(request.term, request.leader_id, now)?;
        let outcome = AppendEntriesProcessor::new(&mut self.log).apply(&request)?;
        if outcome.success {
            let commit = request.leader_commit.min(outcome.match_index);
            if commit > self.hard.commit {
                self.hard.commit = commit;
                self.persist_hard_state()?;
            }
        }
        Ok(outcome.into_response(self.hard.term))
    }

    pub fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
        now: Instant,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        if request.term < self.hard.term {
            return Ok(InstallSnapshotResponse {
                term: self.hard.term,
                match_index: 0,
            });
        }
        self.accept_leader(request.term, request.leader_id, now)?;
        let last_included = TermIndex {
            term: request.last_included_term,
            index: request.last_included_index,
        };
        if last_included.index <= self.hard.commit {
            return Ok(InstallSnapshotResponse {
                term: self.hard.term,
                match_index: last_included.index,
            });
        }
        let snapshot = Snapshot {
            last_included,
            membership: request.membership,
            data: request.data,
        };
        self.snapshots.save(&snapshot)?;
        if self.log.term_at(last_included.index) == Some(last_included.term) {
            self.log.compact_to(last_included.index)?;
        } else {
            self.log.reset(last_included)?;
        }
        self.hard.commit = last_included.index;
        self.persist_hard_state()?;
        self.membership = snapshot.membership.clone();
        self.snapshot = Some(snapshot.clone());
        self.pending_snapshot = Some(snapshot);
        info!(
            "event=raft_snapshot_installed node_id={} index={} term={}",
            self.id, last_included.index, last_included.term
        );
        Ok(InstallSnapshotResponse {
            term: self.hard.term,
            match_index: last_included.index,
        })
    }

    pub fn next_apply(&mut self, max: usize) -> ApplyWork {
        if let Some(snapshot) = self.pending_snapshot.take() {
            return ApplyWork::Snapshot(snapshot);
        }
        if self.applied >= self.hard.commit {
            return ApplyWork::Idle;
        }
        let entries = self.log.entries(self.applied + 1, self.hard.commit, max);
        if entries.is_empty() {
            return ApplyWork::Idle;
        }
        ApplyWork::Entries(entries)
    }

    pub fn mark_applied(&mut self, index: u64) {
        self.applied = self.applied.max(index);
    }

    pub fn mark_snapshot_restored(&mut self, snapshot: &Snapshot) {
        self.membership = snapshot.membership.clone();
        self.applied = self.applied.max(snapshot.index());
    }

    /// Makes a committed membership change effective. Returns messages for
    /// members the leader starts replicating to.
    pub fn apply_conf_change(
        &mut self,
        change: &ConfChange,
        now: Instant,
    ) -> Result<(Membership, Vec<Outbound>), RaftError> {
        let changed = self.membership.apply(change);
        info!(
            "event=raft_conf_change_applied node_id={} kind={:?} target={} changed={changed} voters={}",
            self.id,
            change.kind,
            change.node_id,
            self.membership.voters.len()
        );
        let mut outbound = Vec::new();
        if self.role == Role::Leader {
            if !self.membership.is_voter(self.id) {
                self.become_follower(self.hard.term, None, now)?;
                return Ok((self.membership.clone(), outbound));
            }
            let next_index = self.log.last_index() + 1;
            let members = self.membership.peers_of(self.id);
            self.peers.retain(|id, _| members.contains(id));
            for id in members {
                self.peers.entry(id).or_insert(PeerProgress {
                    next_index,
                    match_index: 0,
                    inflight_since: None,
                    last_ack: now,
                });
            }
            if let Some(quorum) = self.quorum.as_mut() {
                quorum.set_voters(self.membership.voter_ids());
                let own = self.log.last_index();
                let _ = quorum.record_match(self.id, self.log.last_term(), own);
            }
            self.maybe_advance_commit()?;
            outbound = self.broadcast(now, SendMode::Entries);
        }
        Ok((self.membership.clone(), outbound))
    }

    pub fn should_snapshot(&self) -> bool {
        let base = self.snapshot.as_ref().map(Snapshot::index).unwrap_or(0);
        self.applied.saturating_sub(base) >= self.config.snap_count
    }

    /// Persists a state machine image taken at `index` (the applied index)
    /// and compacts the log, keeping a catch-up tail.
    pub fn save_snapshot(&mut self, index: u64, data: Vec<u8>) -> Result<(), RaftError> {
        let Some(term) = self.log.term_at(index) else {
            return Ok(());
        };
        let snapshot = Snapshot {
            last_included: TermIndex { term, index },
            membership: self.membership.clone(),
            data,
        };
        self.snapshots.save(&snapshot)?;
        self.snapshot = Some(snapshot);
        let compact_to = index.saturating_sub(self.config.snap_catch_up_count);
        if compact_to > self.log.base().index {
            self.log.compact_to(compact_to)?;
        }
        info!(
            "event=raft_snapshot_saved node_id={} index={index} term={term} log_first_index={}",
            self.id,
            self.log.first_index()
        );
        Ok(())
    }
}
