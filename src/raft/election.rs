use crate::types::NodeId;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Draws randomized election timeouts from a fixed window. Seeded per node so
/// that members of one cluster spread out deterministically in tests.
#[derive(Debug, Clone)]
pub struct ElectionController {
    window: (Duration, Duration),
    rng: ChaCha20Rng,
}

impl ElectionController {
    pub fn new(min: Duration, max: Duration, seed: u64) -> Self {
        let max = max.max(min);
        Self {
            window: (min, max),
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    pub fn window(&self) -> (Duration, Duration) {
        self.window
    }

    pub fn next_election_timeout(&mut self) -> Duration {
        random_between(&mut self.rng, self.window.0, self.window.1)
    }

    pub fn spawn_candidate(&mut self, candidate_id: NodeId, term: u64, now: Instant) -> CandidateState {
        let timeout = self.next_election_timeout();
        CandidateState::new(candidate_id, term, timeout, now)
    }
}

fn random_between(rng: &mut ChaCha20Rng, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let delta = (max - min).as_millis() as u64;
    min + Duration::from_millis(rng.gen_range(0..=delta))
}

#[derive(Debug, Clone)]
pub struct ElectionTimer {
    timeout: Duration,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: now + timeout,
        }
    }

    pub fn reset(&mut self, now: Instant, timeout: Duration) {
        self.timeout = timeout;
        self.deadline = now + timeout;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Vote tally of one campaign.
#[derive(Debug, Clone)]
pub struct CandidateState {
    candidate_id: NodeId,
    term: u64,
    granted: HashSet<NodeId>,
    rejected: HashSet<NodeId>,
    timer: ElectionTimer,
}

impl CandidateState {
    pub fn new(candidate_id: NodeId, term: u64, timeout: Duration, now: Instant) -> Self {
        let mut granted = HashSet::new();
        granted.insert(candidate_id);
        Self {
            candidate_id,
            term,
            granted,
            rejected: HashSet::new(),
            timer: ElectionTimer::new(now, timeout),
        }
    }

    pub fn candidate_id(&self) -> NodeId {
        self.candidate_id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn record_vote(&mut self, voter: NodeId, granted: bool) {
        if granted {
            self.granted.insert(voter);
            self.rejected.remove(&voter);
        } else {
            self.rejected.insert(voter);
            self.granted.remove(&voter);
        }
    }

    /// Counts only votes from the current voter set.
    pub fn votes_granted(&self, voters: &std::collections::BTreeSet<NodeId>) -> usize {
        self.granted.iter().filter(|id| voters.contains(id)).count()
    }

    pub fn votes_rejected(&self) -> usize {
        self.rejected.len()
    }

    pub fn timer(&self) -> &ElectionTimer {
        &self.timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn election_timeout_stays_inside_window() {
        let mut controller =
            ElectionController::new(Duration::from_millis(150), Duration::from_millis(300), 42);
        for _ in 0..32 {
            let timeout = controller.next_election_timeout();
            assert!(timeout >= Duration::from_millis(150) && timeout <= Duration::from_millis(300));
        }
    }

    #[test]
    fn same_seed_yields_same_schedule() {
        let mut a = ElectionController::new(Duration::from_millis(10), Duration::from_millis(90), 7);
        let mut b = ElectionController::new(Duration::from_millis(10), Duration::from_millis(90), 7);
        for _ in 0..8 {
            assert_eq!(a.next_election_timeout(), b.next_election_timeout());
        }
    }

    #[test]
    fn candidate_state_tracks_votes_and_timeouts() {
        let now = Instant::now();
        let voters: BTreeSet<NodeId> = [1, 2, 3].into_iter().map(NodeId::new).collect();
        let mut candidate =
            CandidateState::new(NodeId::new(1), 4, Duration::from_millis(200), now);
        assert_eq!(candidate.votes_granted(&voters), 1);
        candidate.record_vote(NodeId::new(2), false);
        assert_eq!(candidate.votes_rejected(), 1);
        candidate.record_vote(NodeId::new(2), true);
        candidate.record_vote(NodeId::new(9), true);
        assert_eq!(candidate.votes_granted(&voters), 2);
        assert_eq!(candidate.votes_rejected(), 0);
        assert!(!candidate.timer().expired(now));
        assert!(candidate.timer().expired(now + Duration::from_millis(250)));
    }
}
