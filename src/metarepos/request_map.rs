use crate::metarepos::request::ApplyResult;
use crate::types::NodeId;
use log::trace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

/// Proposals of this node waiting for their entry to be applied.
///
/// Ids start from the wall clock so that entries replayed after a restart
/// never complete a fresh waiter.
#[derive(Debug)]
pub struct RequestMap {
    node_index: NodeId,
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<ApplyResult>>>,
}

impl RequestMap {
    pub fn new(node_index: NodeId) -> Arc<Self> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        Arc::new(Self {
            node_index,
            next_id: AtomicU64::new(millis << 20),
            waiters: Mutex::new(HashMap::new()),
        })
    }

    pub fn node_index(&self) -> NodeId {
        self.node_index
    }

    /// Allocates a request id and registers its waiter. Dropping the
    /// returned guard removes the registration.
    pub fn register(self: &Arc<Self>) -> PendingRequest {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id, tx);
        PendingRequest {
            map: Arc::clone(self),
            request_id,
            receiver: Some(rx),
        }
    }

    /// Hands an apply result to the waiter, if it was proposed here.
    pub fn complete(&self, node_index: NodeId, request_id: u64, result: ApplyResult) {
        if node_index != self.node_index {
            return;
        }
        let Some(tx) = self.waiters.lock().remove(&request_id) else {
            trace!("event=mr_request_unclaimed node={node_index} request_id={request_id}");
            return;
        };
        let _ = tx.send(result);
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, request_id: u64) {
        self.waiters.lock().remove(&request_id);
    }
}

pub struct PendingRequest {
    map: Arc<RequestMap>,
    request_id: u64,
    receiver: Option<oneshot::Receiver<ApplyResult>>,
}

impl PendingRequest {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Resolves once the entry is applied. `None` means the sender went away
    /// without an answer (the map was dropped or the request was taken).
    pub async fn wait(&mut self) -> Option<ApplyResult> {
        let receiver = self.receiver.as_mut()?;
        let result = receiver.await.ok();
        self.receiver = None;
        result
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.map.remove(self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metarepos::request::ApplyOutput;
    use std::time::Duration;

    #[tokio::test]
    async fn completion_wakes_the_waiter() {
        let map = RequestMap::new(NodeId::new(1));
        let mut pending = map.register();
        map.complete(NodeId::new(1), pending.request_id(), Ok(ApplyOutput::Done));
        assert_eq!(pending.wait().await, Some(Ok(ApplyOutput::Done)));
        drop(pending);
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn results_for_other_nodes_are_ignored() {
        let map = RequestMap::new(NodeId::new(1));
        let pending = map.register();
        map.complete(NodeId::new(2), pending.request_id(), Ok(ApplyOutput::Done));
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn timed_out_waiter_leaves_no_entry() {
        let map = RequestMap::new(NodeId::new(1));
        let mut pending = map.register();
        let waited = tokio::time::timeout(Duration::from_millis(10), pending.wait()).await;
        assert!(waited.is_err());
        drop(pending);
        assert!(map.is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let map = RequestMap::new(NodeId::new(1));
        let a = map.register();
        let b = map.register();
        assert_ne!(a.request_id(), b.request_id());
        assert_eq!(map.len(), 2);
    }
}
