use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

/// Backoff schedule used for commit pushes, reconnects and proposal forwarding.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
    time_budget: Option<Duration>,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Linear, max_attempts, base_delay)
    }

    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, max_attempts, base_delay)
    }

    fn new(strategy: RetryStrategy, max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter_fraction: 0.0,
            time_budget: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay).filter(|delay| !delay.is_zero());
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget.filter(|duration| !duration.is_zero());
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
            deadline: self
                .time_budget
                .and_then(|budget| Instant::now().checked_add(budget)),
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let raw = match self.strategy {
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt as u32),
            RetryStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(31) as u32;
                self.base_delay.saturating_mul(1u32 << shift)
            }
        };
        let bounded = match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        };
        if bounded.is_zero() || self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let factor =
            thread_rng().gen_range((1.0 - self.jitter_fraction)..=(1.0 + self.jitter_fraction));
        Duration::from_secs_f64((bounded.as_secs_f64() * factor).max(0.0))
    }

    /// Runs `op` until it succeeds, the attempts or time budget run out, or
    /// `cancel` fires. Returns the last error when giving up.
    pub async fn run<T, E, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut handle = self.handle();
        loop {
            let attempt = handle.attempts() + 1;
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some(delay) = handle.next_delay() else {
                return Err(err);
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
    deadline: Option<Instant>,
}

impl RetryHandle {
    /// Delay before the next attempt, or `None` once the policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        let next = self.attempts + 1;
        let delay = self.policy.delay_for_attempt(next);
        if let Some(deadline) = self.deadline {
            match Instant::now().checked_add(delay) {
                Some(at) if at <= deadline => {}
                _ => return None,
            }
        }
        self.attempts = next;
        Some(delay)
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
