use crate::raft::log_store::{RaftLogError, RaftLogStore};
use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use log::warn;

/// Applies AppendEntries to a follower's log, enforcing log matching and
/// truncating conflicting suffixes.
#[derive(Debug)]
pub struct AppendEntriesProcessor<'a> {
    log: &'a mut RaftLogStore,
}

impl<'a> AppendEntriesProcessor<'a> {
    pub fn new(log: &'a mut RaftLogStore) -> Self {
        Self { log }
    }

    pub fn apply(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesOutcome, RaftLogError> {
        let base = self.log.base().index;
        // Anything at or below the compaction base is committed and matches.
        let (prev_index, prev_term) = if request.prev_log_index < base {
            (base, self.log.base().term)
        } else {
            (request.prev_log_index, request.prev_log_term)
        };
        let entries: Vec<_> = request
            .entries
            .iter()
            .filter(|entry| entry.index > prev_index)
            .cloned()
            .collect();
        if request.prev_log_index >= base {
            match self.log.term_at(prev_index) {
                Some(term) if term == prev_term => {}
                Some(term) => {
                    warn!(
                        "event=raft_append_reject reason=term_mismatch prev_log_index={prev_index} expected_term={prev_term} observed_term={term} leader_term={}",
                        request.term
                    );
                    return Ok(AppendEntriesOutcome::conflict(prev_index, Some(term)));
                }
                None => {
                    warn!(
                        "event=raft_append_reject reason=missing_prefix prev_log_index={prev_index} last_index={} leader_term={}",
                        self.log.last_index(),
                        request.term
                    );
                    return Ok(AppendEntriesOutcome::conflict(self.log.last_index() + 1, None));
                }
            }
        }

        let mut append_from = entries.len();
        for (idx, entry) in entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(term) => {
                    warn!(
                        "event=raft_truncate_conflict index={} existing_term={term} incoming_term={} leader_term={}",
                        entry.index, entry.term, request.term
                    );
                    self.log.truncate_from(entry.index)?;
                    append_from = idx;
                    break;
                }
                None => {
                    append_from = idx;
                    break;
                }
            }
        }
        if append_from < entries.len() {
            self.log.append_batch(&entries[append_from..])?;
        }
        let match_index = entries
            .last()
            .map(|entry| entry.index)
            .unwrap_or(prev_index);
        Ok(AppendEntriesOutcome::success(match_index))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesOutcome {
    pub success: bool,
    pub match_index: u64,
    pub conflict_index: Option<u64>,
    pub conflict_term: Option<u64>,
}

impl AppendEntriesOutcome {
    pub fn success(match_index: u64) -> Self {
        Self {
            success: true,
            match_index,
            conflict_index: None,
            conflict_term: None,
        }
    }

    pub fn conflict(conflict_index: u64, conflict_term: Option<u64>) -> Self {
        Self {
            success: false,
            match_index: 0,
            conflict_index: Some(conflict_index),
            conflict_term,
        }
    }

    pub fn into_response(self, term: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term,
            success: self.success,
            match_index: self.match_index,
            conflict_index: self.conflict_index,
            conflict_term: self.conflict_term,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log_store::RaftEntry;
    use crate::types::NodeId;
    use tempfile::TempDir;

    fn store(terms: &[u64]) -> (TempDir, RaftLogStore) {
        let tmp = TempDir::new().unwrap();
        let mut log = RaftLogStore::open(tmp.path().join("raft.log")).unwrap();
        for (i, term) in terms.iter().enumerate() {
            log.append(RaftEntry::normal(*term, i as u64 + 1, Vec::new()))
                .unwrap();
        }
        (tmp, log)
    }

    fn request(prev: (u64, u64), entries: Vec<RaftEntry>) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term: 3,
            leader_id: NodeId::new(1),
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            leader_commit: 0,
            entries,
        }
    }

    #[test]
    fn applies_entries_and_advances_match_index() {
        let (_tmp, mut log) = store(&[1, 1]);
        let outcome = AppendEntriesProcessor::new(&mut log)
            .apply(&request(
                (2, 1),
                vec![
                    RaftEntry::normal(2, 3, b"c".to_vec()),
                    RaftEntry::normal(2, 4, b"d".to_vec()),
                ],
            ))
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.match_index, 4);
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn truncates_conflicting_suffix() {
        let (_tmp, mut log) = store(&[1, 2, 2]);
        let outcome = AppendEntriesProcessor::new(&mut log)
            .apply(&request((2, 2), vec![RaftEntry::normal(3, 3, b"x".to_vec())]))
            .unwrap();
        assert!(outcome.success);
        assert_eq!(log.term_at(3), Some(3));
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn duplicate_delivery_keeps_longer_log() {
        let (_tmp, mut log) = store(&[1, 1, 1]);
        let outcome = AppendEntriesProcessor::new(&mut log)
            .apply(&request((1, 1), vec![RaftEntry::normal(1, 2, Vec::new())]))
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.match_index, 2);
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn reports_missing_prefix_and_term_mismatch() {
        let (_tmp, mut log) = store(&[1, 1]);
        let outcome = AppendEntriesProcessor::new(&mut log)
            .apply(&request((5, 1), Vec::new()))
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.conflict_index, Some(3));

        let outcome = AppendEntriesProcessor::new(&mut log)
            .apply(&request((2, 2), Vec::new()))
            .unwrap();
        assert_eq!(outcome.conflict_index, Some(2));
        assert_eq!(outcome.conflict_term, Some(1));
    }

    #[test]
    fn entries_below_compaction_base_are_skipped() {
        let (_tmp, mut log) = store(&[1, 1, 1, 1]);
        log.compact_to(3).unwrap();
        let outcome = AppendEntriesProcessor::new(&mut log)
            .apply(&request(
                (1, 1),
                vec![
                    RaftEntry::normal(1, 2, Vec::new()),
                    RaftEntry::normal(1, 3, Vec::new()),
                    RaftEntry::normal(1, 4, Vec::new()),
                    RaftEntry::normal(2, 5, Vec::new()),
                ],
            ))
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.match_index, 5);
        assert_eq!(log.last_index(), 5);
    }
}
