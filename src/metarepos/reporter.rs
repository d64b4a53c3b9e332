use crate::proto::{LogStreamCommitResult, StorageNodeDescriptor, StorageNodeUncommitReport};
use crate::types::StorageNodeId;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ReporterError {
    #[error("reporter: storage node {0} unreachable: {1}")]
    Unreachable(StorageNodeId, String),
    #[error("reporter: storage node {0} closed")]
    Closed(StorageNodeId),
}

/// The metadata repository's view of one storage node: pull reports, push
/// commit results.
#[async_trait]
pub trait ReporterClient: Send + Sync {
    fn storage_node_id(&self) -> StorageNodeId;

    async fn get_report(&self) -> Result<StorageNodeUncommitReport, ReporterError>;

    async fn commit(&self, results: Vec<LogStreamCommitResult>) -> Result<(), ReporterError>;
}

#[async_trait]
pub trait ReporterConnector: Send + Sync {
    async fn connect(
        &self,
        node: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn ReporterClient>, ReporterError>;
}

/// Connection cache keyed by storage node. A client that failed once is
/// dropped and re-established on the next use.
pub struct ReporterPool {
    connector: Arc<dyn ReporterConnector>,
    clients: Mutex<HashMap<StorageNodeId, Arc<dyn ReporterClient>>>,
}

impl ReporterPool {
    pub fn new(connector: Arc<dyn ReporterConnector>) -> Self {
        Self {
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn client(
        &self,
        node: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn ReporterClient>, ReporterError> {
        if let Some(client) = self.clients.lock().get(&node.storage_node_id) {
            return Ok(Arc::clone(client));
        }
        let client = self.connector.connect(node).await?;
        self.clients
            .lock()
            .insert(node.storage_node_id, Arc::clone(&client));
        debug!(
            "event=reporter_connected snid={} address={}",
            node.storage_node_id, node.address
        );
        Ok(client)
    }

    pub fn invalidate(&self, storage_node_id: StorageNodeId) {
        if self.clients.lock().remove(&storage_node_id).is_some() {
            debug!("event=reporter_closed snid={storage_node_id}");
        }
    }

    /// Drops clients of storage nodes that are no longer registered.
    pub fn retain(&self, registered: &BTreeSet<StorageNodeId>) {
        self.clients.lock().retain(|id, _| registered.contains(id));
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        connects: AtomicUsize,
    }

    struct Idle(StorageNodeId);

    #[async_trait]
    impl ReporterClient for Idle {
        fn storage_node_id(&self) -> StorageNodeId {
            self.0
        }

        async fn get_report(&self) -> Result<StorageNodeUncommitReport, ReporterError> {
            Ok(StorageNodeUncommitReport::new(self.0))
        }

        async fn commit(&self, _results: Vec<LogStreamCommitResult>) -> Result<(), ReporterError> {
            Ok(())
        }
    }

    #[async_trait]
    impl ReporterConnector for Counting {
        async fn connect(
            &self,
            node: &StorageNodeDescriptor,
        ) -> Result<Arc<dyn ReporterClient>, ReporterError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Idle(node.storage_node_id)))
        }
    }

    #[tokio::test]
    async fn pool_reuses_clients_until_invalidated() {
        let connector = Arc::new(Counting {
            connects: AtomicUsize::new(0),
        });
        let pool = ReporterPool::new(connector.clone());
        let node = StorageNodeDescriptor::new(StorageNodeId::new(1), "sn-1");
        pool.client(&node).await.unwrap();
        pool.client(&node).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        pool.invalidate(node.storage_node_id);
        pool.client(&node).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        pool.retain(&BTreeSet::new());
        assert!(pool.is_empty());
    }
}
