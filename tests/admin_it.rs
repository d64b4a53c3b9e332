mod support;

use replog::admin::AdminError;
use replog::proto::{LogStreamStatus, ReplicaDescriptor, SyncState};
use replog::storage::{ReadAt, StorageError};
use replog::storagenode::StorageNodeError;
use replog::types::{Glsn, LogStreamId, StorageNodeId, TopicId};
use replog::ClusterManager;
use support::{wait_until, TestCluster, WAIT};

const TOPIC: TopicId = TopicId(1);
const LS: LogStreamId = LogStreamId(1);

fn replicas(snids: &[i32]) -> Vec<ReplicaDescriptor> {
    snids
        .iter()
        .map(|snid| ReplicaDescriptor::new(StorageNodeId(*snid), ""))
        .collect()
}

async fn registered_cluster(cluster: &mut TestCluster, storage_nodes: &[i32]) -> ClusterManager {
    cluster.start_repositories(1);
    cluster.leader().await;
    let admin = cluster.admin();
    for snid in storage_nodes {
        cluster.start_storage_node(*snid);
        admin.add_storage_node(cluster.descriptor(*snid)).await.unwrap();
    }
    admin.add_topic(TOPIC).await.unwrap();
    admin
}

/// Appends on the primary and waits until the backup applied the commit too.
async fn append_committed(cluster: &TestCluster, payloads: &[&str]) -> Glsn {
    let primary = &cluster.storage_nodes[&StorageNodeId(1)];
    let positions = primary
        .append(
            TOPIC,
            LS,
            payloads.iter().map(|p| p.as_bytes().to_vec()).collect(),
        )
        .await
        .unwrap();
    let last = positions.last().unwrap().glsn;
    let backup = cluster.storage_nodes[&StorageNodeId(2)].executor(LS).unwrap();
    assert!(wait_until(WAIT, || backup.metadata().local_high_watermark.glsn == last).await);
    last
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_log_stream_checks_placement_before_creating_replicas() {
    let mut cluster = TestCluster::new(2);
    let admin = registered_cluster(&mut cluster, &[1, 2]).await;

    let err = admin.add_log_stream(TOPIC, LS, replicas(&[1])).await.unwrap_err();
    assert!(matches!(err, AdminError::InvalidArgument(_)));
    let err = admin.add_log_stream(TOPIC, LS, replicas(&[1, 1])).await.unwrap_err();
    assert!(matches!(err, AdminError::InvalidArgument(_)));
    let err = admin
        .add_log_stream(TopicId(5), LS, replicas(&[1, 2]))
        .await
        .unwrap_err();
    assert!(matches!(err, AdminError::InvalidArgument(_)));
    let err = admin.add_log_stream(TOPIC, LS, replicas(&[1, 3])).await.unwrap_err();
    assert!(matches!(
        err,
        AdminError::StorageNodeNotRegistered(StorageNodeId(3))
    ));
    for node in cluster.storage_nodes.values() {
        assert!(node.get_metadata().log_streams.is_empty());
    }

    let placed = admin.add_log_stream(TOPIC, LS, replicas(&[1, 2])).await.unwrap();
    assert_eq!(placed.replicas[0].storage_node_id, StorageNodeId(1));
    assert!(placed.replicas.iter().all(|replica| !replica.path.is_empty()));
    assert_eq!(admin.log_stream_status(LS), Some(LogStreamStatus::Running));
    let metadata = admin.metadata().await.unwrap();
    assert_eq!(metadata.log_stream(LS).unwrap().replicas, placed.replicas);
    for node in cluster.storage_nodes.values() {
        assert_eq!(node.get_metadata().log_streams.len(), 1);
    }

    let err = admin.add_log_stream(TOPIC, LS, replicas(&[1, 2])).await.unwrap_err();
    assert!(matches!(err, AdminError::InvalidArgument(_)));

    admin.close();
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seal_stops_appends_until_unsealed() {
    let mut cluster = TestCluster::new(2);
    let admin = registered_cluster(&mut cluster, &[1, 2]).await;
    admin.add_log_stream(TOPIC, LS, replicas(&[1, 2])).await.unwrap();
    let last = append_committed(&cluster, &["a", "b"]).await;

    let outcome = admin.seal(TOPIC, LS).await.unwrap();
    assert_eq!(outcome.last_committed_glsn, last);
    assert!(outcome.is_complete());
    assert_eq!(admin.log_stream_status(LS), Some(LogStreamStatus::Sealed));
    let metadata = admin.metadata().await.unwrap();
    assert!(metadata.log_stream(LS).unwrap().status.is_sealed());

    admin.unseal(TOPIC, LS).await.unwrap();
    assert_eq!(admin.log_stream_status(LS), Some(LogStreamStatus::Running));
    for node in cluster.storage_nodes.values() {
        assert_eq!(node.executor(LS).unwrap().status(), LogStreamStatus::Running);
    }
    let next = append_committed(&cluster, &["c"]).await;
    assert!(next > last);

    admin.close();
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_replica_fails_the_seal_and_restores_the_status() {
    let mut cluster = TestCluster::new(2);
    let admin = registered_cluster(&mut cluster, &[1, 2]).await;
    admin.add_log_stream(TOPIC, LS, replicas(&[1, 2])).await.unwrap();
    append_committed(&cluster, &["a"]).await;

    cluster.registry.isolate(StorageNodeId(2));
    let err = admin.seal(TOPIC, LS).await.unwrap_err();
    assert!(matches!(
        err,
        AdminError::RejectedByStorageNodeManager(StorageNodeError::Unreachable(StorageNodeId(2)))
    ));
    assert_eq!(admin.log_stream_status(LS), Some(LogStreamStatus::Running));

    cluster.registry.heal(StorageNodeId(2));
    let outcome = admin.seal(TOPIC, LS).await.unwrap();
    assert!(outcome.is_complete());

    admin.close();
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trim_removes_the_prefix_on_every_replica() {
    let mut cluster = TestCluster::new(2);
    let admin = registered_cluster(&mut cluster, &[1, 2]).await;
    admin.add_log_stream(TOPIC, LS, replicas(&[1, 2])).await.unwrap();
    let last = append_committed(&cluster, &["a", "b", "c"]).await;
    assert_eq!(last, Glsn(3));

    let outcomes = admin.trim(TOPIC, Glsn(2)).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, outcome)| outcome.is_ok()));
    for node in cluster.storage_nodes.values() {
        let executor = node.executor(LS).unwrap();
        assert!(matches!(
            executor.storage().read(ReadAt::Glsn(Glsn(2))),
            Err(StorageError::NoLogEntry)
        ));
        assert_eq!(executor.storage().read(ReadAt::Glsn(Glsn(3))).unwrap().data, b"c");
        assert_eq!(executor.metadata().local_low_watermark.glsn, Glsn(3));
    }

    let err = admin.trim(TopicId(7), Glsn(1)).await.unwrap_err();
    assert!(matches!(err, AdminError::TrimFailed(_)));

    admin.close();
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_copies_the_sealed_log_onto_a_new_replica() {
    let mut cluster = TestCluster::new(2);
    let admin = registered_cluster(&mut cluster, &[1, 2, 3]).await;
    admin.add_log_stream(TOPIC, LS, replicas(&[1, 2])).await.unwrap();
    let last = append_committed(&cluster, &["a", "b"]).await;
    assert!(admin.seal(TOPIC, LS).await.unwrap().is_complete());

    let learner = cluster.storage_nodes[&StorageNodeId(3)].clone();
    learner
        .add_log_stream(TOPIC, LS, "", vec![learner.replica(TOPIC, LS)])
        .unwrap();
    let (status, _) = learner.seal(TOPIC, LS, last).await.unwrap();
    assert_eq!(status, LogStreamStatus::Sealing);

    let err = admin
        .sync(TOPIC, LS, StorageNodeId(3), StorageNodeId(3))
        .await
        .unwrap_err();
    assert!(matches!(err, AdminError::InvalidArgument(_)));

    let progress = admin
        .sync(TOPIC, LS, StorageNodeId(1), StorageNodeId(3))
        .await
        .unwrap();
    assert_ne!(progress.state, SyncState::Error);
    let executor = learner.executor(LS).unwrap();
    assert!(
        wait_until(WAIT, || {
            executor.status() == LogStreamStatus::Sealed
                && executor.metadata().local_high_watermark.glsn == last
        })
        .await
    );
    let entry = executor.storage().read(ReadAt::Glsn(Glsn(1))).unwrap();
    assert_eq!(entry.data, b"a");
    assert_eq!(executor.storage().read_commit_context().unwrap().high_watermark, last);

    admin.close();
    cluster.shutdown().await;
}
