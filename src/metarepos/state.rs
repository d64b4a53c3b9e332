use crate::metarepos::error::MetadataError;
use crate::metarepos::request::{ApplyOutput, ApplyResult, Request};
use crate::proto::{
    GlobalCommit, LogStreamCommitResult, LogStreamDescriptor, LogStreamStatus,
    LogStreamUncommitReport, Member, MetadataDescriptor, StorageNodeDescriptor,
    StorageNodeUncommitReport, TopicDescriptor, TopicStatus,
};
use crate::types::{Glsn, Llsn, LogStreamId, NodeId, StorageNodeId, TopicId, Version};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Latest report of every replica of one log stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaReports {
    pub status: LogStreamStatus,
    pub reports: BTreeMap<StorageNodeId, LogStreamUncommitReport>,
}

/// Output of [`RepositoryState::calculate_commit`] for one log stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitCalculation {
    pub known_high_watermark: Glsn,
    pub min_high_watermark: Glsn,
    pub count: u64,
}

/// The replicated state machine of the metadata repository. Every member
/// applies the same entries in the same order and must end up with an
/// identical value, so nothing in here reads clocks or local configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryState {
    replication_factor: usize,
    metadata: MetadataDescriptor,
    uncommits: BTreeMap<LogStreamId, ReplicaReports>,
    commits: VecDeque<GlobalCommit>,
    members: BTreeMap<NodeId, Member>,
    applied_index: u64,
}

impl RepositoryState {
    pub fn new(replication_factor: usize) -> Self {
        Self {
            replication_factor,
            ..Default::default()
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn metadata(&self) -> &MetadataDescriptor {
        &self.metadata
    }

    pub fn members(&self) -> &BTreeMap<NodeId, Member> {
        &self.members
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn set_applied_index(&mut self, index: u64) {
        self.applied_index = self.applied_index.max(index);
    }

    pub fn high_watermark(&self) -> Glsn {
        self.commits
            .back()
            .map(|commit| commit.high_watermark)
            .unwrap_or(Glsn::INVALID)
    }

    pub fn version(&self) -> Version {
        self.commits
            .back()
            .map(|commit| commit.version)
            .unwrap_or(Version::INVALID)
    }

    pub fn history_len(&self) -> usize {
        self.commits.len()
    }

    pub fn replica_reports(&self, log_stream_id: LogStreamId) -> Option<&ReplicaReports> {
        self.uncommits.get(&log_stream_id)
    }

    pub fn apply(&mut self, request: &Request) -> ApplyResult {
        match request {
            Request::RegisterStorageNode { storage_node } => {
                self.register_storage_node(storage_node)
            }
            Request::UnregisterStorageNode { storage_node_id } => {
                self.unregister_storage_node(*storage_node_id)
            }
            Request::RegisterTopic { topic_id } => self.register_topic(*topic_id),
            Request::UnregisterTopic { topic_id } => self.unregister_topic(*topic_id),
            Request::RegisterLogStream { log_stream } => self.register_log_stream(log_stream),
            Request::UnregisterLogStream { log_stream_id } => {
                self.unregister_log_stream(*log_stream_id)
            }
            Request::UpdateLogStream { log_stream } => self.update_log_stream(log_stream),
            Request::Report { reports } => {
                for report in reports {
                    self.apply_report(report);
                }
                Ok(ApplyOutput::Done)
            }
            Request::Commit => {
                self.apply_commit();
                Ok(ApplyOutput::Done)
            }
            Request::Seal { log_stream_id } => self.seal(*log_stream_id),
            Request::Unseal { log_stream_id } => self.unseal(*log_stream_id),
            Request::AddPeer {
                node_id,
                url,
                learner,
            } => self.add_peer(*node_id, url, *learner),
            Request::RemovePeer { node_id } => self.remove_peer(*node_id),
        }
        .map_err(|err| {
            debug!("event=mr_apply_rejected request={} error={err}", request.name());
            err
        })
    }

    fn register_storage_node(&mut self, node: &StorageNodeDescriptor) -> ApplyResult {
        if self.metadata.storage_nodes.contains_key(&node.storage_node_id) {
            return Err(MetadataError::AlreadyExists(format!(
                "storage node {}",
                node.storage_node_id
            )));
        }
        self.metadata
            .storage_nodes
            .insert(node.storage_node_id, node.clone());
        info!(
            "event=mr_storage_node_registered snid={} address={}",
            node.storage_node_id, node.address
        );
        Ok(ApplyOutput::Done)
    }

    fn unregister_storage_node(&mut self, storage_node_id: StorageNodeId) -> ApplyResult {
        if !self.metadata.storage_nodes.contains_key(&storage_node_id) {
            return Err(not_found_storage_node(storage_node_id));
        }
        if let Some(ls) = self.metadata.log_streams_on(storage_node_id).next() {
            return Err(MetadataError::FailedPrecondition(format!(
                "storage node {storage_node_id} still hosts log stream {}",
                ls.log_stream_id
            )));
        }
        self.metadata.storage_nodes.remove(&storage_node_id);
        info!("event=mr_storage_node_unregistered snid={storage_node_id}");
        Ok(ApplyOutput::Done)
    }

    fn register_topic(&mut self, topic_id: TopicId) -> ApplyResult {
        if self.metadata.topics.contains_key(&topic_id) {
            return Err(MetadataError::AlreadyExists(format!("topic {topic_id}")));
        }
        self.metadata.topics.insert(
            topic_id,
            TopicDescriptor {
                topic_id,
                status: TopicStatus::Running,
                log_streams: Vec::new(),
            },
        );
        info!("event=mr_topic_registered tpid={topic_id}");
        Ok(ApplyOutput::Done)
    }

    /// Drops the topic together with its log streams.
    fn unregister_topic(&mut self, topic_id: TopicId) -> ApplyResult {
        let Some(topic) = self.metadata.topics.remove(&topic_id) else {
            return Err(MetadataError::NotFound(format!("topic {topic_id}")));
        };
        for lsid in topic.log_streams {
            self.metadata.log_streams.remove(&lsid);
            self.uncommits.remove(&lsid);
        }
        info!("event=mr_topic_unregistered tpid={topic_id}");
        Ok(ApplyOutput::Done)
    }

    fn validate_replicas(&self, log_stream: &LogStreamDescriptor) -> Result<(), MetadataError> {
        if log_stream.replicas.len() != self.replication_factor {
            return Err(MetadataError::InvalidArgument(format!(
                "log stream {} has {} replicas, replication factor is {}",
                log_stream.log_stream_id,
                log_stream.replicas.len(),
                self.replication_factor
            )));
        }
        let mut seen = BTreeSet::new();
        for replica in &log_stream.replicas {
            if !seen.insert(replica.storage_node_id) {
                return Err(MetadataError::InvalidArgument(format!(
                    "log stream {} places two replicas on storage node {}",
                    log_stream.log_stream_id, replica.storage_node_id
                )));
            }
            if !self
                .metadata
                .storage_nodes
                .contains_key(&replica.storage_node_id)
            {
                return Err(not_found_storage_node(replica.storage_node_id));
            }
        }
        Ok(())
    }

    fn register_log_stream(&mut self, log_stream: &LogStreamDescriptor) -> ApplyResult {
        let lsid = log_stream.log_stream_id;
        if !self.metadata.topics.contains_key(&log_stream.topic_id) {
            return Err(MetadataError::NotFound(format!(
                "topic {}",
                log_stream.topic_id
            )));
        }
        if self.metadata.log_streams.contains_key(&lsid) {
            return Err(MetadataError::AlreadyExists(format!("log stream {lsid}")));
        }
        self.validate_replicas(log_stream)?;

        let reports = log_stream
            .replicas
            .iter()
            .map(|replica| {
                (
                    replica.storage_node_id,
                    LogStreamUncommitReport::new(lsid, Glsn::INVALID, Llsn::MIN, 0),
                )
            })
            .collect();
        self.uncommits.insert(
            lsid,
            ReplicaReports {
                status: LogStreamStatus::Running,
                reports,
            },
        );
        let mut descriptor = log_stream.clone();
        descriptor.status = LogStreamStatus::Running;
        self.metadata.log_streams.insert(lsid, descriptor);
        if let Some(topic) = self.metadata.topics.get_mut(&log_stream.topic_id) {
            topic.log_streams.push(lsid);
        }
        info!(
            "event=mr_log_stream_registered tpid={} lsid={lsid} replicas={}",
            log_stream.topic_id,
            log_stream.replicas.len()
        );
        Ok(ApplyOutput::Done)
    }

    fn unregister_log_stream(&mut self, log_stream_id: LogStreamId) -> ApplyResult {
        let Some(ls) = self.metadata.log_streams.remove(&log_stream_id) else {
            return Err(not_found_log_stream(log_stream_id));
        };
        self.uncommits.remove(&log_stream_id);
        if let Some(topic) = self.metadata.topics.get_mut(&ls.topic_id) {
            topic.log_streams.retain(|lsid| *lsid != log_stream_id);
        }
        info!("event=mr_log_stream_unregistered lsid={log_stream_id}");
        Ok(ApplyOutput::Done)
    }

    /// Swaps the replica set of a sealed log stream. Retained replicas keep
    /// their reports; new ones start at the committed end.
    fn update_log_stream(&mut self, log_stream: &LogStreamDescriptor) -> ApplyResult {
        let lsid = log_stream.log_stream_id;
        let Some(current) = self.metadata.log_streams.get(&lsid) else {
            return Err(not_found_log_stream(lsid));
        };
        if current.topic_id != log_stream.topic_id {
            return Err(MetadataError::InvalidArgument(format!(
                "log stream {lsid} belongs to topic {}",
                current.topic_id
            )));
        }
        let sealed = self
            .uncommits
            .get(&lsid)
            .is_some_and(|replicas| replicas.status.is_sealed());
        if !sealed {
            return Err(MetadataError::FailedPrecondition(format!(
                "log stream {lsid} is not sealed"
            )));
        }
        self.validate_replicas(log_stream)?;

        let committed_end = self.committed_llsn_end(lsid);
        let hwm = self.high_watermark();
        let previous = self
            .uncommits
            .remove(&lsid)
            .map(|replicas| replicas.reports)
            .unwrap_or_default();
        let reports = log_stream
            .replicas
            .iter()
            .map(|replica| {
                let report = previous
                    .get(&replica.storage_node_id)
                    .copied()
                    .unwrap_or_else(|| LogStreamUncommitReport::new(lsid, hwm, committed_end, 0));
                (replica.storage_node_id, report)
            })
            .collect();
        self.uncommits.insert(
            lsid,
            ReplicaReports {
                status: LogStreamStatus::Sealed,
                reports,
            },
        );
        let mut descriptor = log_stream.clone();
        descriptor.status = LogStreamStatus::Sealed;
        self.metadata.log_streams.insert(lsid, descriptor);
        info!("event=mr_log_stream_updated lsid={lsid}");
        Ok(ApplyOutput::Done)
    }

    /// Merges one storage node's reports. A report only replaces the stored
    /// one when its uncommitted end did not move backwards.
    pub fn apply_report(&mut self, report: &StorageNodeUncommitReport) {
        let snid = report.storage_node_id;
        for ls_report in &report.reports {
            let lsid = ls_report.log_stream_id;
            let is_replica = self
                .metadata
                .log_stream(lsid)
                .is_some_and(|ls| ls.is_replica(snid));
            if !is_replica {
                continue;
            }
            let Some(replicas) = self.uncommits.get_mut(&lsid) else {
                continue;
            };
            match replicas.reports.get_mut(&snid) {
                Some(stored)
                    if ls_report.uncommitted_llsn_end() < stored.uncommitted_llsn_end() => {}
                Some(stored) => *stored = *ls_report,
                None => {
                    replicas.reports.insert(snid, *ls_report);
                }
            }
        }
    }

    /// Commit count every replica of one log stream can agree on, together
    /// with the highest and lowest high watermark they report.
    pub fn calculate_commit(&self, replicas: &ReplicaReports) -> CommitCalculation {
        if replicas.reports.is_empty() || replicas.reports.len() < self.replication_factor {
            return CommitCalculation::default();
        }
        let mut begin = Llsn::INVALID;
        let mut end = Llsn::MAX;
        let mut known = Glsn::INVALID;
        let mut min = Glsn::MAX;
        for report in replicas.reports.values() {
            begin = begin.max(report.uncommitted_llsn_offset);
            end = end.min(report.uncommitted_llsn_end());
            known = known.max(report.high_watermark);
            min = min.min(report.high_watermark);
        }
        CommitCalculation {
            known_high_watermark: known,
            min_high_watermark: min,
            count: if begin <= end { end.distance_from(begin) } else { 0 },
        }
    }

    /// Entries of `log_stream_id` committed by retained rounds that started
    /// at or after `high_watermark`.
    pub fn num_commit_since(&self, log_stream_id: LogStreamId, high_watermark: Glsn) -> u64 {
        self.commits
            .iter()
            .filter(|commit| commit.prev_high_watermark >= high_watermark)
            .filter_map(|commit| commit.result_for(log_stream_id))
            .map(|result| result.committed_glsn_length)
            .sum()
    }

    /// Computes the next round without touching the state. Returns the round,
    /// if it commits anything, and the high watermark below which history is
    /// no longer needed.
    fn next_commit(&self) -> (Option<GlobalCommit>, Glsn) {
        let cur = self.high_watermark();
        let version = self.version().next();
        let latest = self.commits.back();
        let mut next_glsn = cur.next();
        let mut trim = Glsn::MAX;
        let mut total = 0u64;
        let mut results = Vec::with_capacity(self.uncommits.len());

        for (lsid, replicas) in &self.uncommits {
            let lsid = *lsid;
            let calc = self.calculate_commit(replicas);
            trim = trim.min(calc.min_high_watermark);
            let mut count = if replicas.status.is_sealed() {
                0
            } else {
                calc.count
            };
            if count > 0 && calc.known_high_watermark != cur {
                let already = self.num_commit_since(lsid, calc.known_high_watermark);
                if already > count {
                    warn!(
                        "event=mr_commit_inconsistent lsid={lsid} known_hwm={} count={count} already_committed={already}",
                        calc.known_high_watermark
                    );
                    count = 0;
                } else {
                    count -= already;
                }
            }

            let last = latest.and_then(|commit| commit.result_for(lsid));
            let committed_llsn_offset = last
                .map(|result| result.committed_llsn_offset + result.committed_glsn_length)
                .unwrap_or(Llsn::MIN);
            let committed_glsn_offset = if count > 0 {
                next_glsn
            } else {
                last.map(LogStreamCommitResult::committed_glsn_end)
                    .unwrap_or(Glsn::MIN)
            };
            next_glsn += count;
            total += count;

            let topic_id = self
                .metadata
                .log_stream(lsid)
                .map(|ls| ls.topic_id)
                .unwrap_or_default();
            results.push(LogStreamCommitResult {
                topic_id,
                log_stream_id: lsid,
                version,
                prev_high_watermark: cur,
                high_watermark: Glsn::INVALID,
                committed_llsn_offset,
                committed_glsn_offset,
                committed_glsn_length: count,
            });
        }

        if total == 0 {
            return (None, trim);
        }
        let high_watermark = cur + total;
        for result in &mut results {
            result.high_watermark = high_watermark;
        }
        let commit = GlobalCommit {
            version,
            high_watermark,
            prev_high_watermark: cur,
            results,
        };
        (Some(commit), trim)
    }

    /// Whether a commit round run now would commit anything.
    pub fn would_commit(&self) -> bool {
        self.next_commit().0.is_some()
    }

    /// Runs one global commit round over the applied reports.
    pub fn apply_commit(&mut self) {
        let (commit, trim) = self.next_commit();
        if let Some(commit) = commit {
            debug!(
                "event=mr_global_commit version={} prev_hwm={} hwm={} committed={}",
                commit.version,
                commit.prev_high_watermark,
                commit.high_watermark,
                commit.total_committed()
            );
            self.commits.push_back(commit);
        }
        while self.commits.len() > 1
            && self
                .commits
                .front()
                .is_some_and(|commit| commit.high_watermark <= trim)
        {
            self.commits.pop_front();
        }
    }

    /// Last GLSN committed to `log_stream_id`, or INVALID when nothing was.
    pub fn last_committed(&self, log_stream_id: LogStreamId) -> Glsn {
        self.commits
            .back()
            .and_then(|commit| commit.result_for(log_stream_id))
            .map(LogStreamCommitResult::last_committed_glsn)
            .unwrap_or(Glsn::INVALID)
    }

    fn committed_llsn_end(&self, log_stream_id: LogStreamId) -> Llsn {
        self.commits
            .back()
            .and_then(|commit| commit.result_for(log_stream_id))
            .map(|result| result.committed_llsn_offset + result.committed_glsn_length)
            .unwrap_or(Llsn::MIN)
    }

    /// Clamps every stored report of the log stream to its committed end so
    /// entries a replica drops while sealing are not counted again.
    fn clamp_reports(&mut self, log_stream_id: LogStreamId) {
        let committed_end = self.committed_llsn_end(log_stream_id);
        let Some(replicas) = self.uncommits.get_mut(&log_stream_id) else {
            return;
        };
        for report in replicas.reports.values_mut() {
            if report.uncommitted_llsn_end() <= committed_end {
                continue;
            }
            if report.uncommitted_llsn_offset > committed_end {
                report.uncommitted_llsn_offset = committed_end;
            }
            report.uncommitted_llsn_length =
                committed_end.distance_from(report.uncommitted_llsn_offset);
        }
    }

    fn set_status(&mut self, log_stream_id: LogStreamId, status: LogStreamStatus) {
        if let Some(replicas) = self.uncommits.get_mut(&log_stream_id) {
            replicas.status = status;
        }
        if let Some(ls) = self.metadata.log_streams.get_mut(&log_stream_id) {
            ls.status = status;
        }
    }

    /// Seals the log stream after folding in every applied report. Sealing
    /// twice returns the same GLSN.
    fn seal(&mut self, log_stream_id: LogStreamId) -> ApplyResult {
        if !self.uncommits.contains_key(&log_stream_id) {
            return Err(not_found_log_stream(log_stream_id));
        }
        // Commits pending reports of every log stream first, so a seal can
        // bump the version for the others.
        self.apply_commit();
        let last = self.last_committed(log_stream_id);
        let sealed = self
            .uncommits
            .get(&log_stream_id)
            .is_some_and(|replicas| replicas.status.is_sealed());
        if !sealed {
            self.set_status(log_stream_id, LogStreamStatus::Sealed);
            info!("event=mr_log_stream_sealed lsid={log_stream_id} last_committed_glsn={last}");
        }
        self.clamp_reports(log_stream_id);
        Ok(ApplyOutput::LastCommitted(last))
    }

    fn unseal(&mut self, log_stream_id: LogStreamId) -> ApplyResult {
        if !self.uncommits.contains_key(&log_stream_id) {
            return Err(not_found_log_stream(log_stream_id));
        }
        self.set_status(log_stream_id, LogStreamStatus::Running);
        self.clamp_reports(log_stream_id);
        info!("event=mr_log_stream_unsealed lsid={log_stream_id}");
        Ok(ApplyOutput::Done)
    }

    fn add_peer(&mut self, node_id: NodeId, url: &str, learner: bool) -> ApplyResult {
        let member = Member {
            node_id,
            peer_url: url.to_string(),
            learner,
        };
        match self.members.get(&node_id) {
            Some(existing) if *existing == member => {
                Err(MetadataError::AlreadyExists(format!("peer {node_id}")))
            }
            _ => {
                self.members.insert(node_id, member);
                Ok(ApplyOutput::Done)
            }
        }
    }

    fn remove_peer(&mut self, node_id: NodeId) -> ApplyResult {
        match self.members.remove(&node_id) {
            Some(_) => Ok(ApplyOutput::Done),
            None => Err(MetadataError::NotFound(format!("peer {node_id}"))),
        }
    }

    /// Commit results the storage node still has to apply, one per hosted
    /// log stream: the first retained round above the replica's last
    /// reported high watermark.
    ///
    /// Rounds are only trimmed once every replica reported past them, so a
    /// replica whose watermark precedes the oldest retained round had
    /// nothing committed in between and may take that round directly.
    pub fn commit_results_for(&self, storage_node_id: StorageNodeId) -> Vec<LogStreamCommitResult> {
        let mut results = Vec::new();
        for ls in self.metadata.log_streams_on(storage_node_id) {
            let lsid = ls.log_stream_id;
            let Some(report) = self
                .uncommits
                .get(&lsid)
                .and_then(|replicas| replicas.reports.get(&storage_node_id))
            else {
                continue;
            };
            let next = self
                .commits
                .iter()
                .filter(|commit| commit.high_watermark > report.high_watermark)
                .find_map(|commit| commit.result_for(lsid));
            if let Some(result) = next {
                let mut result = *result;
                result.prev_high_watermark = report.high_watermark;
                results.push(result);
            }
        }
        results
    }
}

fn not_found_storage_node(storage_node_id: StorageNodeId) -> MetadataError {
    MetadataError::NotFound(format!("storage node {storage_node_id}"))
}

fn not_found_log_stream(log_stream_id: LogStreamId) -> MetadataError {
    MetadataError::NotFound(format!("log stream {log_stream_id}"))
}
