use crate::executor::error::ExecutorError;
use crate::proto::LogStreamStatus;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Replica status plus the barrier that mutating paths hold while they run.
///
/// The status itself is lock-free so that the replicator can push a replica
/// into Sealing from its dispatch loop while appenders sit on the barrier.
/// Seal takes the barrier exclusively before dropping uncommitted data.
pub struct ExecutorState {
    status: AtomicU8,
    barrier: RwLock<()>,
    seal_reason: Mutex<Option<String>>,
}

impl ExecutorState {
    pub fn new(status: LogStreamStatus) -> Self {
        Self {
            status: AtomicU8::new(encode(status)),
            barrier: RwLock::new(()),
            seal_reason: Mutex::new(None),
        }
    }

    pub fn status(&self) -> LogStreamStatus {
        decode(self.status.load(Ordering::Acquire))
    }

    pub fn set(&self, status: LogStreamStatus) {
        self.status.store(encode(status), Ordering::Release);
    }

    /// Moves `from` to `to`; false when the current status differs.
    pub fn transition(&self, from: LogStreamStatus, to: LogStreamStatus) -> bool {
        self.status
            .compare_exchange(encode(from), encode(to), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Shared barrier for a mutating operation that requires `expected`.
    pub async fn guard(
        &self,
        op: &'static str,
        expected: LogStreamStatus,
    ) -> Result<RwLockReadGuard<'_, ()>, ExecutorError> {
        let guard = self.barrier.read().await;
        let status = self.status();
        if status != expected {
            return Err(ExecutorError::invalid_status(op, status));
        }
        Ok(guard)
    }

    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.barrier.write().await
    }

    /// Running or Learning replicas fall back to Sealing and remember why.
    pub fn set_sealing_with_reason(&self, reason: impl Into<String>) {
        let reason = reason.into();
        for from in [LogStreamStatus::Running, LogStreamStatus::Learning] {
            if self.transition(from, LogStreamStatus::Sealing) {
                warn!("event=replica_sealing from={} reason={reason}", from.as_str());
                *self.seal_reason.lock() = Some(reason);
                return;
            }
        }
    }

    pub fn set_sealing(&self) {
        if self.transition(LogStreamStatus::Running, LogStreamStatus::Sealing) {
            info!("event=replica_sealing from=running reason=admin");
            *self.seal_reason.lock() = Some("sealed by request".into());
        }
    }

    pub fn seal_reason(&self) -> Option<String> {
        self.seal_reason.lock().clone()
    }

    pub fn clear_seal_reason(&self) {
        self.seal_reason.lock().take();
    }
}

fn encode(status: LogStreamStatus) -> u8 {
    match status {
        LogStreamStatus::Running => 0,
        LogStreamStatus::Sealing => 1,
        LogStreamStatus::Sealed => 2,
        LogStreamStatus::Unsealing => 3,
        LogStreamStatus::Learning => 4,
        LogStreamStatus::Deleted => 5,
    }
}

fn decode(raw: u8) -> LogStreamStatus {
    match raw {
        0 => LogStreamStatus::Running,
        1 => LogStreamStatus::Sealing,
        2 => LogStreamStatus::Sealed,
        3 => LogStreamStatus::Unsealing,
        4 => LogStreamStatus::Learning,
        _ => LogStreamStatus::Deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_rejects_other_statuses() {
        let state = ExecutorState::new(LogStreamStatus::Running);
        assert!(state.guard("append", LogStreamStatus::Running).await.is_ok());
        state.set_sealing_with_reason("replica 2 unreachable");
        assert_eq!(state.status(), LogStreamStatus::Sealing);
        assert!(matches!(
            state.guard("append", LogStreamStatus::Running).await,
            Err(ExecutorError::InvalidStatus { status: "sealing", .. })
        ));
        assert_eq!(state.seal_reason().as_deref(), Some("replica 2 unreachable"));
    }

    #[test]
    fn sealing_does_not_override_sealed() {
        let state = ExecutorState::new(LogStreamStatus::Sealed);
        state.set_sealing_with_reason("late failure");
        assert_eq!(state.status(), LogStreamStatus::Sealed);
        assert!(state.seal_reason().is_none());
    }
}
