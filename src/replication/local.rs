use super::{
    Connector, ConnectorFactory, ReplicationClient, ReplicationError, ReplicationHandler,
};
use crate::proto::{Replica, SyncPayload, SyncPosition, SyncRange};
use crate::types::{Llsn, LogStreamId, StorageNodeId};
use async_trait::async_trait;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type RouteKey = (StorageNodeId, LogStreamId);

/// In-process routing table from `(storage node, log stream)` to the executor
/// that serves it. Handlers are held weakly so that a closed executor simply
/// becomes unreachable. Clones share the same table.
#[derive(Clone, Default)]
pub struct LocalReplicationNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    routes: RwLock<HashMap<RouteKey, Weak<dyn ReplicationHandler>>>,
    isolated: RwLock<HashSet<StorageNodeId>>,
}

impl LocalReplicationNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        storage_node_id: StorageNodeId,
        log_stream_id: LogStreamId,
        handler: Weak<dyn ReplicationHandler>,
    ) {
        let key = (storage_node_id, log_stream_id);
        self.inner.routes.write().insert(key, handler);
    }

    pub fn unregister(&self, storage_node_id: StorageNodeId, log_stream_id: LogStreamId) {
        self.inner.routes.write().remove(&(storage_node_id, log_stream_id));
    }

    /// Every request to `storage_node_id` fails as unreachable until healed.
    pub fn isolate(&self, storage_node_id: StorageNodeId) {
        debug!("event=replication_isolate storage_node_id={storage_node_id}");
        self.inner.isolated.write().insert(storage_node_id);
    }

    pub fn heal(&self, storage_node_id: StorageNodeId) {
        self.inner.isolated.write().remove(&storage_node_id);
    }

    fn route(&self, replica: &Replica) -> Result<Arc<dyn ReplicationHandler>, ReplicationError> {
        let unreachable = || ReplicationError::Unreachable {
            storage_node_id: replica.storage_node_id,
            log_stream_id: replica.log_stream_id,
        };
        if self.inner.isolated.read().contains(&replica.storage_node_id) {
            return Err(unreachable());
        }
        self.inner
            .routes
            .read()
            .get(&(replica.storage_node_id, replica.log_stream_id))
            .and_then(Weak::upgrade)
            .ok_or_else(unreachable)
    }
}

impl ConnectorFactory for LocalReplicationNetwork {
    fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(LocalConnector::new(self.clone()))
    }
}

pub struct LocalConnector {
    network: LocalReplicationNetwork,
    clients: Mutex<HashMap<RouteKey, Arc<LocalClient>>>,
    closed: AtomicBool,
}

impl LocalConnector {
    pub fn new(network: LocalReplicationNetwork) -> Self {
        Self {
            network,
            clients: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn get(&self, replica: &Replica) -> Result<Arc<dyn ReplicationClient>, ReplicationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplicationError::ConnectionClosed);
        }
        let key = (replica.storage_node_id, replica.log_stream_id);
        let mut clients = self.clients.lock();
        let client = clients
            .entry(key)
            .or_insert_with(|| {
                Arc::new(LocalClient {
                    replica: replica.clone(),
                    network: self.network.clone(),
                    closed: AtomicBool::new(false),
                })
            })
            .clone();
        Ok(client)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let clients: Vec<_> = self.clients.lock().drain().map(|(_, client)| client).collect();
        for client in clients {
            client.close().await;
        }
    }
}

struct LocalClient {
    replica: Replica,
    network: LocalReplicationNetwork,
    closed: AtomicBool,
}

impl LocalClient {
    fn handler(&self) -> Result<Arc<dyn ReplicationHandler>, ReplicationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplicationError::ConnectionClosed);
        }
        self.network.route(&self.replica)
    }
}

#[async_trait]
impl ReplicationClient for LocalClient {
    fn replica(&self) -> &Replica {
        &self.replica
    }

    async fn replicate(&self, llsn: Llsn, data: Vec<u8>) -> Result<(), ReplicationError> {
        self.handler()?.handle_replicate(llsn, data).await
    }

    async fn sync_init(
        &self,
        source: &Replica,
        range: SyncRange,
    ) -> Result<SyncPosition, ReplicationError> {
        self.handler()?.handle_sync_init(source, range).await
    }

    async fn sync_replicate(
        &self,
        source: &Replica,
        payload: SyncPayload,
    ) -> Result<(), ReplicationError> {
        self.handler()?.handle_sync_replicate(source, payload).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TopicId;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Llsn>>,
    }

    #[async_trait]
    impl ReplicationHandler for Recorder {
        async fn handle_replicate(&self, llsn: Llsn, _data: Vec<u8>) -> Result<(), ReplicationError> {
            self.seen.lock().push(llsn);
            Ok(())
        }

        async fn handle_sync_init(
            &self,
            _source: &Replica,
            range: SyncRange,
        ) -> Result<SyncPosition, ReplicationError> {
            Ok(SyncPosition::new(Llsn::INVALID, range.first_glsn))
        }

        async fn handle_sync_replicate(
            &self,
            _source: &Replica,
            _payload: SyncPayload,
        ) -> Result<(), ReplicationError> {
            Ok(())
        }
    }

    fn replica(sn: i32) -> Replica {
        Replica::new(StorageNodeId(sn), TopicId(1), LogStreamId(1), format!("sn-{sn}"))
    }

    #[tokio::test]
    async fn routes_to_registered_handler() {
        let network = LocalReplicationNetwork::new();
        let recorder = Arc::new(Recorder::default());
        let weak = Arc::downgrade(&recorder) as Weak<dyn ReplicationHandler>;
        network.register(StorageNodeId(2), LogStreamId(1), weak);

        let connector = network.connector();
        let client = connector.get(&replica(2)).await.unwrap();
        client.replicate(Llsn(1), b"a".to_vec()).await.unwrap();
        client.replicate(Llsn(2), b"b".to_vec()).await.unwrap();
        assert_eq!(*recorder.seen.lock(), vec![Llsn(1), Llsn(2)]);
    }

    #[tokio::test]
    async fn isolated_and_dropped_handlers_are_unreachable() {
        let network = LocalReplicationNetwork::new();
        let recorder = Arc::new(Recorder::default());
        network.register(
            StorageNodeId(2),
            LogStreamId(1),
            Arc::downgrade(&recorder) as Weak<dyn ReplicationHandler>,
        );
        let connector = network.connector();
        let client = connector.get(&replica(2)).await.unwrap();

        network.isolate(StorageNodeId(2));
        assert!(matches!(
            client.replicate(Llsn(1), Vec::new()).await,
            Err(ReplicationError::Unreachable { .. })
        ));
        network.heal(StorageNodeId(2));
        client.replicate(Llsn(1), Vec::new()).await.unwrap();

        drop(recorder);
        assert!(matches!(
            client.replicate(Llsn(2), Vec::new()).await,
            Err(ReplicationError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn closed_connector_refuses_clients() {
        let network = LocalReplicationNetwork::new();
        let connector = network.connector();
        let client = connector.get(&replica(3)).await.unwrap();
        connector.close().await;
        assert_eq!(
            client.replicate(Llsn(1), Vec::new()).await,
            Err(ReplicationError::ConnectionClosed)
        );
        assert_eq!(
            connector.get(&replica(3)).await.err(),
            Some(ReplicationError::ConnectionClosed)
        );
    }
}
