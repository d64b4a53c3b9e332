#![allow(dead_code)]

use replog::admin::{AdminConfig, ClusterManager, LocalMrConnector};
use replog::metarepos::{MetadataRepository, MetadataRepositoryConfig};
use replog::proto::{LogStreamUncommitReport, StorageNodeDescriptor, StorageNodeUncommitReport};
use replog::raft::LocalRaftNetwork;
use replog::replication::LocalReplicationNetwork;
use replog::storagenode::{StorageNode, StorageNodeConfig, StorageNodeRegistry};
use replog::types::{ClusterId, Glsn, Llsn, LogStreamId, NodeId, StorageNodeId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const CLUSTER: ClusterId = ClusterId(1);
pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_logging() {
    replog::util::init_test_logging();
}

/// Polls `cond` until it holds or `timeout` passes.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn report(
    storage_node_id: i32,
    reports: &[(i32, u64, u64, u64)],
) -> StorageNodeUncommitReport {
    let mut report = StorageNodeUncommitReport::new(StorageNodeId(storage_node_id));
    for &(lsid, hwm, offset, length) in reports {
        report.reports.push(LogStreamUncommitReport::new(
            LogStreamId(lsid),
            Glsn(hwm),
            Llsn(offset),
            length,
        ));
    }
    report
}

pub fn mr_url(node_id: u64) -> String {
    format!("mr-{node_id}")
}

/// In-process cluster: raft-replicated metadata repository members plus
/// storage nodes sharing one replication network.
pub struct TestCluster {
    pub dir: TempDir,
    pub replication_factor: usize,
    pub raft_network: LocalRaftNetwork,
    pub replication: LocalReplicationNetwork,
    pub registry: StorageNodeRegistry,
    pub repositories: Vec<Arc<MetadataRepository>>,
    pub storage_nodes: BTreeMap<StorageNodeId, Arc<StorageNode>>,
}

impl TestCluster {
    pub fn new(replication_factor: usize) -> Self {
        init_logging();
        Self {
            dir: TempDir::new().unwrap(),
            replication_factor,
            raft_network: LocalRaftNetwork::new(),
            replication: LocalReplicationNetwork::new(),
            registry: StorageNodeRegistry::new(CLUSTER),
            repositories: Vec::new(),
            storage_nodes: BTreeMap::new(),
        }
    }

    pub fn mr_config(&self, node_id: u64, peers: &[u64]) -> MetadataRepositoryConfig {
        let mut config = MetadataRepositoryConfig::new(
            CLUSTER,
            NodeId(node_id),
            mr_url(node_id),
            self.dir.path().join(format!("mr{node_id}")),
        )
        .with_replication_factor(self.replication_factor);
        config.raft = config
            .raft
            .with_peers(peers.iter().map(|id| (NodeId(*id), mr_url(*id))).collect())
            .with_election_timeout(Duration::from_millis(100), Duration::from_millis(200));
        config
    }

    /// Starts the founding members `1..=members`.
    pub fn start_repositories(&mut self, members: u64) {
        let peers: Vec<u64> = (1..=members).collect();
        for node_id in &peers {
            let config = self.mr_config(*node_id, &peers);
            self.start_repository(config);
        }
    }

    pub fn start_repository(&mut self, config: MetadataRepositoryConfig) -> Arc<MetadataRepository> {
        let repository = MetadataRepository::start_local(
            config,
            &self.raft_network,
            Arc::new(self.registry.clone()),
        )
        .unwrap();
        self.repositories.push(Arc::clone(&repository));
        repository
    }

    pub async fn leader(&self) -> Arc<MetadataRepository> {
        let mut leader = None;
        let found = wait_until(WAIT, || {
            leader = self
                .repositories
                .iter()
                .find(|mr| !mr.is_stopped() && mr.is_leader())
                .cloned();
            leader.is_some()
        })
        .await;
        assert!(found, "no metadata repository leader elected");
        leader.unwrap()
    }

    pub fn repository(&self, node_id: u64) -> Arc<MetadataRepository> {
        self.repositories
            .iter()
            .find(|mr| mr.node_id() == NodeId(node_id))
            .cloned()
            .unwrap()
    }

    pub fn start_storage_node(&mut self, storage_node_id: i32) -> Arc<StorageNode> {
        let snid = StorageNodeId(storage_node_id);
        let config = StorageNodeConfig::new(
            CLUSTER,
            snid,
            self.dir.path().join(format!("sn{storage_node_id}")),
        );
        let node = StorageNode::new(config, self.replication.clone()).unwrap();
        self.registry.insert(Arc::clone(&node));
        self.storage_nodes.insert(snid, Arc::clone(&node));
        node
    }

    pub fn descriptor(&self, storage_node_id: i32) -> StorageNodeDescriptor {
        let node = &self.storage_nodes[&StorageNodeId(storage_node_id)];
        let volumes = node
            .volumes()
            .iter()
            .map(|volume| volume.display().to_string());
        StorageNodeDescriptor::new(node.storage_node_id(), node.address()).with_paths(volumes)
    }

    pub fn admin(&self) -> ClusterManager {
        let config = AdminConfig::new(CLUSTER, self.replication_factor)
            .with_metadata_reload_interval(Duration::from_millis(50));
        ClusterManager::new(
            config,
            Arc::new(LocalMrConnector::new(self.repositories.clone())),
            Arc::new(self.registry.clone()),
        )
        .unwrap()
    }

    pub async fn shutdown(self) {
        for node in self.storage_nodes.values() {
            node.close().await;
        }
        for repository in &self.repositories {
            repository.stop().await;
        }
    }
}
