use crate::types::{Glsn, Llsn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Appenders parked until their LLSN is committed. Dropping a sender wakes
/// the appender with an abort.
#[derive(Default)]
pub struct AppendWaiters {
    pending: Mutex<BTreeMap<Llsn, oneshot::Sender<Glsn>>>,
}

impl AppendWaiters {
    pub fn register(&self, llsn: Llsn) -> oneshot::Receiver<Glsn> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(llsn, tx);
        rx
    }

    /// Resolves `count` waiters starting at `llsn_begin` with consecutive GLSNs.
    pub fn resolve(&self, llsn_begin: Llsn, glsn_begin: Glsn, count: u64) {
        if count == 0 {
            return;
        }
        let end = llsn_begin + count;
        let resolved: Vec<_> = {
            let mut pending = self.pending.lock();
            let mut tail = pending.split_off(&llsn_begin);
            let mut rest = tail.split_off(&end);
            pending.append(&mut rest);
            tail.into_iter().collect()
        };
        for (llsn, tx) in resolved {
            let _ = tx.send(glsn_begin + llsn.distance_from(llsn_begin));
        }
    }

    pub fn fail_all(&self) -> usize {
        let dropped = std::mem::take(&mut *self.pending.lock());
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
