use crate::types::NodeId;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Snapshot of a voter's log progress as seen by the leader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaProgress {
    pub matched_index: u64,
    pub matched_term: u64,
}

impl ReplicaProgress {
    pub fn new(matched_term: u64, matched_index: u64) -> Self {
        Self {
            matched_term,
            matched_index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionQuorumStatus {
    pub committed_index: u64,
    pub committed_term: u64,
    pub quorum_size: usize,
}

/// Tracks matched positions of the voting members and derives the commit
/// index. Learners never enter the quorum.
#[derive(Debug)]
pub struct PartitionQuorum {
    voters: BTreeSet<NodeId>,
    progress: HashMap<NodeId, ReplicaProgress>,
    committed_index: u64,
    committed_term: u64,
}

impl PartitionQuorum {
    pub fn new(voters: impl IntoIterator<Item = NodeId>, committed_index: u64) -> Self {
        let voters: BTreeSet<NodeId> = voters.into_iter().collect();
        let progress = voters
            .iter()
            .map(|id| (*id, ReplicaProgress::default()))
            .collect();
        Self {
            voters,
            progress,
            committed_index,
            committed_term: 0,
        }
    }

    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn voters(&self) -> &BTreeSet<NodeId> {
        &self.voters
    }

    /// Replaces the voter set, keeping progress for voters that remain.
    pub fn set_voters(&mut self, voters: impl IntoIterator<Item = NodeId>) {
        self.voters = voters.into_iter().collect();
        let voters = &self.voters;
        self.progress.retain(|id, _| voters.contains(id));
        for id in voters {
            self.progress.entry(*id).or_default();
        }
    }

    pub fn progress(&self, id: NodeId) -> Option<ReplicaProgress> {
        self.progress.get(&id).copied()
    }

    pub fn record_match(
        &mut self,
        id: NodeId,
        matched_term: u64,
        matched_index: u64,
    ) -> Result<(), QuorumError> {
        if !self.voters.contains(&id) {
            return Err(QuorumError::UnknownReplica(id));
        }
        let progress = self.progress.entry(id).or_default();
        if matched_index < progress.matched_index {
            warn!(
                "event=raft_quorum_violation kind=matched_index_regression replica={id} previous={} attempted={matched_index}",
                progress.matched_index
            );
            return Err(QuorumError::MatchedIndexRegression {
                previous: progress.matched_index,
                attempted: matched_index,
            });
        }
        if matched_index == progress.matched_index
            && matched_index != 0
            && matched_term < progress.matched_term
        {
            warn!(
                "event=raft_quorum_violation kind=term_regression replica={id} index={matched_index} previous_term={} attempted_term={matched_term}",
                progress.matched_term
            );
            return Err(QuorumError::TermRegressionAtIndex {
                index: matched_index,
                previous_term: progress.matched_term,
                attempted_term: matched_term,
            });
        }
        progress.matched_index = matched_index;
        progress.matched_term = matched_term;
        Ok(())
    }

    /// Advances the committed index when a quorum replicated an entry from
    /// the leader's term. Entries of older terms commit only indirectly.
    pub fn advance_commit(&mut self, leader_term: u64) -> u64 {
        let quorum = self.quorum();
        if self.voters.is_empty() || self.progress.len() < quorum {
            return self.committed_index;
        }
        let mut matches: Vec<ReplicaProgress> = self.progress.values().copied().collect();
        matches.sort_by(|a, b| {
            a.matched_index
                .cmp(&b.matched_index)
                .then_with(|| a.matched_term.cmp(&b.matched_term))
        });
        let candidate = matches[matches.len() - quorum];
        if candidate.matched_index > self.committed_index && candidate.matched_term == leader_term {
            self.committed_index = candidate.matched_index;
            self.committed_term = candidate.matched_term;
            info!(
                "event=raft_commit_advance committed_index={} committed_term={} quorum_size={quorum}",
                self.committed_index, self.committed_term
            );
        }
        self.committed_index
    }

    pub fn committed_index(&self) -> u64 {
        self.committed_index
    }

    pub fn status(&self) -> PartitionQuorumStatus {
        PartitionQuorumStatus {
            committed_index: self.committed_index,
            committed_term: self.committed_term,
            quorum_size: self.quorum(),
        }
    }
}

/// Raft's "at least as up-to-date" rule: higher last term wins, then the
/// longer log.
pub fn log_is_up_to_date(
    candidate_term: u64,
    candidate_index: u64,
    local_term: u64,
    local_index: u64,
) -> bool {
    match candidate_term.cmp(&local_term) {
        Ordering::Equal => candidate_index >= local_index,
        other => other == Ordering::Greater,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QuorumError {
    #[error("replica matched index regression: previous={previous} attempted={attempted}")]
    MatchedIndexRegression { previous: u64, attempted: u64 },

    #[error(
        "term regression at index {index}: previous={previous_term} attempted={attempted_term}"
    )]
    TermRegressionAtIndex {
        index: u64,
        previous_term: u64,
        attempted_term: u64,
    },

    #[error("unknown replica {0}")]
    UnknownReplica(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn record_progress_is_monotone() {
        let mut quorum = PartitionQuorum::new(ids(&[1, 2, 3]), 0);
        quorum.record_match(NodeId::new(1), 1, 10).unwrap();

        let err = quorum.record_match(NodeId::new(1), 1, 9).unwrap_err();
        assert!(matches!(err, QuorumError::MatchedIndexRegression { .. }));

        let err = quorum.record_match(NodeId::new(1), 0, 10).unwrap_err();
        assert!(matches!(err, QuorumError::TermRegressionAtIndex { .. }));

        let err = quorum.record_match(NodeId::new(9), 1, 1).unwrap_err();
        assert!(matches!(err, QuorumError::UnknownReplica(_)));
    }

    #[test]
    fn advance_commit_respects_leader_term() {
        let mut quorum = PartitionQuorum::new(ids(&[1, 2, 3, 4, 5]), 0);
        for id in [1, 2, 3] {
            quorum.record_match(NodeId::new(id), 2, 15).unwrap();
        }
        quorum.record_match(NodeId::new(4), 1, 20).unwrap();
        quorum.record_match(NodeId::new(5), 1, 20).unwrap();

        assert_eq!(quorum.advance_commit(2), 15);
        assert_eq!(quorum.status().committed_term, 2);
        assert_eq!(quorum.advance_commit(3), 15, "cannot advance without matching term");
    }

    #[test]
    fn voter_changes_keep_surviving_progress() {
        let mut quorum = PartitionQuorum::new(ids(&[1, 2, 3]), 0);
        quorum.record_match(NodeId::new(2), 1, 7).unwrap();
        quorum.set_voters(ids(&[1, 2, 3, 4]));
        assert_eq!(quorum.quorum(), 3);
        assert_eq!(quorum.progress(NodeId::new(2)).unwrap().matched_index, 7);
        assert_eq!(quorum.progress(NodeId::new(4)).unwrap().matched_index, 0);

        quorum.set_voters(ids(&[1, 2]));
        assert!(quorum.progress(NodeId::new(3)).is_none());
        assert_eq!(quorum.quorum(), 2);
    }

    #[test]
    fn up_to_date_follows_term_then_index() {
        assert!(log_is_up_to_date(3, 30, 3, 30));
        assert!(log_is_up_to_date(4, 10, 3, 30));
        assert!(!log_is_up_to_date(2, 100, 3, 30));
        assert!(!log_is_up_to_date(3, 29, 3, 30));
    }
}
