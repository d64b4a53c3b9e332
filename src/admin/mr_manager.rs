use crate::admin::cache::ClusterMetadataCache;
use crate::admin::error::AdminError;
use crate::metarepos::{MetadataRepository, RepositoryError};
use crate::proto::{ClusterInfo, LogStreamDescriptor, MetadataDescriptor, StorageNodeDescriptor};
use crate::types::{Glsn, LogStreamId, NodeId, StorageNodeId, TopicId};
use crate::util::RetryPolicy;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The metadata repository as seen by administrative tooling.
#[async_trait]
pub trait MrClient: Send + Sync {
    async fn register_storage_node(
        &self,
        storage_node: StorageNodeDescriptor,
    ) -> Result<(), RepositoryError>;

    async fn unregister_storage_node(
        &self,
        storage_node_id: StorageNodeId,
    ) -> Result<(), RepositoryError>;

    async fn register_topic(&self, topic_id: TopicId) -> Result<(), RepositoryError>;

    async fn unregister_topic(&self, topic_id: TopicId) -> Result<(), RepositoryError>;

    async fn register_log_stream(
        &self,
        log_stream: LogStreamDescriptor,
    ) -> Result<(), RepositoryError>;

    async fn unregister_log_stream(&self, log_stream_id: LogStreamId)
        -> Result<(), RepositoryError>;

    async fn update_log_stream(&self, log_stream: LogStreamDescriptor)
        -> Result<(), RepositoryError>;

    async fn seal(&self, log_stream_id: LogStreamId) -> Result<Glsn, RepositoryError>;

    async fn unseal(&self, log_stream_id: LogStreamId) -> Result<(), RepositoryError>;

    async fn add_peer(
        &self,
        node_id: NodeId,
        url: String,
        learner: bool,
    ) -> Result<(), RepositoryError>;

    async fn remove_peer(&self, node_id: NodeId) -> Result<(), RepositoryError>;

    async fn get_metadata(&self) -> Result<MetadataDescriptor, RepositoryError>;

    async fn get_cluster_info(&self) -> Result<ClusterInfo, RepositoryError>;
}

#[async_trait]
pub trait MrConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn MrClient>, RepositoryError>;
}

fn ensure_running(repository: &MetadataRepository) -> Result<(), RepositoryError> {
    if repository.is_stopped() {
        return Err(RepositoryError::Stopped);
    }
    Ok(())
}

#[async_trait]
impl MrClient for MetadataRepository {
    async fn register_storage_node(
        &self,
        storage_node: StorageNodeDescriptor,
    ) -> Result<(), RepositoryError> {
        MetadataRepository::register_storage_node(self, storage_node).await
    }

    async fn unregister_storage_node(
        &self,
        storage_node_id: StorageNodeId,
    ) -> Result<(), RepositoryError> {
        MetadataRepository::unregister_storage_node(self, storage_node_id).await
    }

    async fn register_topic(&self, topic_id: TopicId) -> Result<(), RepositoryError> {
        MetadataRepository::register_topic(self, topic_id).await
    }

    async fn unregister_topic(&self, topic_id: TopicId) -> Result<(), RepositoryError> {
        MetadataRepository::unregister_topic(self, topic_id).await
    }

    async fn register_log_stream(
        &self,
        log_stream: LogStreamDescriptor,
    ) -> Result<(), RepositoryError> {
        MetadataRepository::register_log_stream(self, log_stream).await
    }

    async fn unregister_log_stream(
        &self,
        log_stream_id: LogStreamId,
    ) -> Result<(), RepositoryError> {
        MetadataRepository::unregister_log_stream(self, log_stream_id).await
    }

    async fn update_log_stream(
        &self,
        log_stream: LogStreamDescriptor,
    ) -> Result<(), RepositoryError> {
        MetadataRepository::update_log_stream(self, log_stream).await
    }

    async fn seal(&self, log_stream_id: LogStreamId) -> Result<Glsn, RepositoryError> {
        MetadataRepository::seal(self, log_stream_id).await
    }

    async fn unseal(&self, log_stream_id: LogStreamId) -> Result<(), RepositoryError> {
        MetadataRepository::unseal(self, log_stream_id).await
    }

    async fn add_peer(
        &self,
        node_id: NodeId,
        url: String,
        learner: bool,
    ) -> Result<(), RepositoryError> {
        MetadataRepository::add_peer(self, node_id, url, learner).await
    }

    async fn remove_peer(&self, node_id: NodeId) -> Result<(), RepositoryError> {
        MetadataRepository::remove_peer(self, node_id).await
    }

    async fn get_metadata(&self) -> Result<MetadataDescriptor, RepositoryError> {
        ensure_running(self)?;
        Ok(MetadataRepository::get_metadata(self))
    }

    async fn get_cluster_info(&self) -> Result<ClusterInfo, RepositoryError> {
        ensure_running(self)?;
        Ok(MetadataRepository::get_cluster_info(self))
    }
}

/// Connects to the running in-process members, preferring the leader.
pub struct LocalMrConnector {
    members: Vec<Arc<MetadataRepository>>,
}

impl LocalMrConnector {
    pub fn new(members: Vec<Arc<MetadataRepository>>) -> Self {
        Self { members }
    }
}

#[async_trait]
impl MrConnector for LocalMrConnector {
    async fn connect(&self) -> Result<Arc<dyn MrClient>, RepositoryError> {
        let running = || self.members.iter().filter(|member| !member.is_stopped());
        let chosen = running()
            .find(|member| member.is_leader())
            .or_else(|| running().next())
            .ok_or(RepositoryError::Stopped)?;
        Ok(Arc::clone(chosen) as Arc<dyn MrClient>)
    }
}

/// Admin-side access to the metadata repository. A client that fails with a
/// connectivity error is closed and the call retried on a fresh connection.
pub struct MetadataRepositoryManager {
    connector: Arc<dyn MrConnector>,
    client: Mutex<Option<Arc<dyn MrClient>>>,
    cache: ClusterMetadataCache<MetadataDescriptor>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl MetadataRepositoryManager {
    pub fn new(connector: Arc<dyn MrConnector>, reload_interval: Duration) -> Self {
        Self {
            connector,
            client: Mutex::new(None),
            cache: ClusterMetadataCache::new(reload_interval),
            retry: RetryPolicy::exponential(5, Duration::from_millis(50))
                .with_max_delay(Duration::from_millis(500)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn client(&self) -> Result<Arc<dyn MrClient>, RepositoryError> {
        let cached = self.client.lock().clone();
        if let Some(client) = cached {
            return Ok(client);
        }
        let client = self.connector.connect().await?;
        *self.client.lock() = Some(Arc::clone(&client));
        Ok(client)
    }

    fn close_client(&self) {
        if self.client.lock().take().is_some() {
            debug!("event=mr_client_closed");
        }
    }

    async fn call<T, F, Fut>(&self, op: F) -> Result<T, AdminError>
    where
        F: Fn(Arc<dyn MrClient>) -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        let this = self;
        let op = &op;
        let outcome = self
            .retry
            .run(&self.cancel, move |attempt| async move {
                let result = match this.client().await {
                    Ok(client) => op(client).await,
                    Err(err) => Err(err),
                };
                match result {
                    Err(err) if err.is_retryable() => {
                        debug!("event=mr_call_retry attempt={attempt} error={err}");
                        this.close_client();
                        Err(err)
                    }
                    other => Ok(other),
                }
            })
            .await;
        match outcome {
            Ok(result) => Ok(result?),
            Err(err) => Err(err.into()),
        }
    }

    /// Cluster metadata, served from the cache while it is fresh.
    pub async fn cluster_metadata(&self) -> Result<Arc<MetadataDescriptor>, AdminError> {
        self.cache
            .get(|| self.call(|client| async move { client.get_metadata().await }))
            .await
    }

    pub fn invalidate_metadata(&self) {
        self.cache.invalidate();
    }

    pub async fn get_cluster_info(&self) -> Result<ClusterInfo, AdminError> {
        self.call(|client| async move { client.get_cluster_info().await })
            .await
    }

    pub async fn register_storage_node(
        &self,
        storage_node: StorageNodeDescriptor,
    ) -> Result<(), AdminError> {
        let result = self
            .call(|client| {
                let storage_node = storage_node.clone();
                async move { client.register_storage_node(storage_node).await }
            })
            .await;
        self.cache.invalidate();
        result
    }

    pub async fn unregister_storage_node(
        &self,
        storage_node_id: StorageNodeId,
    ) -> Result<(), AdminError> {
        let result = self
            .call(|client| async move { client.unregister_storage_node(storage_node_id).await })
            .await;
        self.cache.invalidate();
        result
    }

    pub async fn register_topic(&self, topic_id: TopicId) -> Result<(), AdminError> {
        let result = self
            .call(|client| async move { client.register_topic(topic_id).await })
            .await;
        self.cache.invalidate();
        result
    }

    pub async fn unregister_topic(&self, topic_id: TopicId) -> Result<(), AdminError> {
        let result = self
            .call(|client| async move { client.unregister_topic(topic_id).await })
            .await;
        self.cache.invalidate();
        result
    }

    pub async fn register_log_stream(
        &self,
        log_stream: LogStreamDescriptor,
    ) -> Result<(), AdminError> {
        let result = self
            .call(|client| {
                let log_stream = log_stream.clone();
                async move { client.register_log_stream(log_stream).await }
            })
            .await;
        self.cache.invalidate();
        result
    }

    pub async fn unregister_log_stream(&self, log_stream_id: LogStreamId) -> Result<(), AdminError> {
        let result = self
            .call(|client| async move { client.unregister_log_stream(log_stream_id).await })
            .await;
        self.cache.invalidate();
        result
    }

    pub async fn update_log_stream(&self, log_stream: LogStreamDescriptor) -> Result<(), AdminError> {
        let result = self
            .call(|client| {
                let log_stream = log_stream.clone();
                async move { client.update_log_stream(log_stream).await }
            })
            .await;
        self.cache.invalidate();
        result
    }

    pub async fn seal(&self, log_stream_id: LogStreamId) -> Result<Glsn, AdminError> {
        let result = self
            .call(|client| async move { client.seal(log_stream_id).await })
            .await;
        self.cache.invalidate();
        result
    }

    pub async fn unseal(&self, log_stream_id: LogStreamId) -> Result<(), AdminError> {
        let result = self
            .call(|client| async move { client.unseal(log_stream_id).await })
            .await;
        self.cache.invalidate();
        result
    }

    pub async fn add_peer(
        &self,
        node_id: NodeId,
        url: impl Into<String>,
        learner: bool,
    ) -> Result<(), AdminError> {
        let url = url.into();
        self.call(|client| {
            let url = url.clone();
            async move { client.add_peer(node_id, url, learner).await }
        })
        .await?;
        info!("event=mr_peer_added node_id={node_id} learner={learner}");
        Ok(())
    }

    pub async fn remove_peer(&self, node_id: NodeId) -> Result<(), AdminError> {
        self.call(|client| async move { client.remove_peer(node_id).await })
            .await?;
        info!("event=mr_peer_removed node_id={node_id}");
        Ok(())
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.close_client();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::RaftError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls with an unreachable member.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MrClient for Flaky {
        async fn register_storage_node(
            &self,
            _storage_node: StorageNodeDescriptor,
        ) -> Result<(), RepositoryError> {
            unimplemented!()
        }
        async fn unregister_storage_node(
            &self,
            _storage_node_id: StorageNodeId,
        ) -> Result<(), RepositoryError> {
            unimplemented!()
        }
        async fn register_topic(&self, topic_id: TopicId) -> Result<(), RepositoryError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(RaftError::Unreachable(NodeId::new(2)).into());
            }
            if topic_id == TopicId::new(0) {
                return Err(crate::metarepos::MetadataError::InvalidArgument("zero".into()).into());
            }
            Ok(())
        }
        async fn unregister_topic(&self, _topic_id: TopicId) -> Result<(), RepositoryError> {
            unimplemented!()
        }
        async fn register_log_stream(
            &self,
            _log_stream: LogStreamDescriptor,
        ) -> Result<(), RepositoryError> {
            unimplemented!()
        }
        async fn unregister_log_stream(
            &self,
            _log_stream_id: LogStreamId,
        ) -> Result<(), RepositoryError> {
            unimplemented!()
        }
        async fn update_log_stream(
            &self,
            _log_stream: LogStreamDescriptor,
        ) -> Result<(), RepositoryError> {
            unimplemented!()
        }
        async fn seal(&self, _log_stream_id: LogStreamId) -> Result<Glsn, RepositoryError> {
            unimplemented!()
        }
        async fn unseal(&self, _log_stream_id: LogStreamId) -> Result<(), RepositoryError> {
            unimplemented!()
        }
        async fn add_peer(
            &self,
            _node_id: NodeId,
            _url: String,
            _learner: bool,
        ) -> Result<(), RepositoryError> {
            unimplemented!()
        }
        async fn remove_peer(&self, _node_id: NodeId) -> Result<(), RepositoryError> {
            unimplemented!()
        }
        async fn get_metadata(&self) -> Result<MetadataDescriptor, RepositoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MetadataDescriptor::default())
        }
        async fn get_cluster_info(&self) -> Result<ClusterInfo, RepositoryError> {
            unimplemented!()
        }
    }

    struct Connector {
        client: Arc<Flaky>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl MrConnector for Connector {
        async fn connect(&self) -> Result<Arc<dyn MrClient>, RepositoryError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.client.clone())
        }
    }

    fn manager(failures: usize) -> (Arc<Connector>, MetadataRepositoryManager) {
        let connector = Arc::new(Connector {
            client: Arc::new(Flaky {
                failures,
                calls: AtomicUsize::new(0),
            }),
            connects: AtomicUsize::new(0),
        });
        let manager = MetadataRepositoryManager::new(connector.clone(), Duration::from_secs(60))
            .with_retry(RetryPolicy::linear(4, Duration::from_millis(1)));
        (connector, manager)
    }

    #[tokio::test]
    async fn connectivity_errors_reconnect_and_retry() {
        let (connector, manager) = manager(2);
        manager.register_topic(TopicId::new(1)).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let (connector, manager) = manager(0);
        let err = manager.register_topic(TopicId::new(0)).await.unwrap_err();
        assert!(matches!(err, AdminError::RejectedByMetadataRepository(_)));
        assert_eq!(connector.client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn metadata_is_cached_until_a_mutation() {
        let (connector, manager) = manager(0);
        manager.cluster_metadata().await.unwrap();
        manager.cluster_metadata().await.unwrap();
        assert_eq!(connector.client.calls.load(Ordering::SeqCst), 1);

        manager.register_topic(TopicId::new(1)).await.unwrap();
        manager.cluster_metadata().await.unwrap();
        assert_eq!(connector.client.calls.load(Ordering::SeqCst), 3);
    }
}
