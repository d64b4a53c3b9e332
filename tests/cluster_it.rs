mod support;

use replog::executor::ExecutorError;
use replog::proto::{LogStreamStatus, ReplicaDescriptor};
use replog::storage::ReadAt;
use replog::storagenode::StorageNodeError;
use replog::types::{Glsn, Llsn, LogStreamId, StorageNodeId, TopicId};
use replog::ClusterManager;
use support::{wait_until, TestCluster, WAIT};

const TOPIC: TopicId = TopicId(1);

async fn two_node_log_streams(cluster: &mut TestCluster, log_streams: &[i32]) -> ClusterManager {
    cluster.start_repositories(1);
    cluster.leader().await;
    for snid in [1, 2] {
        cluster.start_storage_node(snid);
    }
    let admin = cluster.admin();
    for snid in [1, 2] {
        admin.add_storage_node(cluster.descriptor(snid)).await.unwrap();
    }
    admin.add_topic(TOPIC).await.unwrap();
    for lsid in log_streams {
        admin
            .add_log_stream(
                TOPIC,
                LogStreamId(*lsid),
                vec![
                    ReplicaDescriptor::new(StorageNodeId(1), ""),
                    ReplicaDescriptor::new(StorageNodeId(2), ""),
                ],
            )
            .await
            .unwrap();
    }
    admin
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn appends_resolve_with_global_positions_on_every_replica() {
    let mut cluster = TestCluster::new(2);
    let admin = two_node_log_streams(&mut cluster, &[1]).await;
    let primary = cluster.storage_nodes[&StorageNodeId(1)].clone();
    let backup = cluster.storage_nodes[&StorageNodeId(2)].clone();

    let positions = primary
        .append(TOPIC, LogStreamId(1), vec![b"a".to_vec(), b"b".to_vec()])
        .await
        .unwrap();
    let glsns: Vec<_> = positions.iter().map(|lsn| lsn.glsn).collect();
    let llsns: Vec<_> = positions.iter().map(|lsn| lsn.llsn).collect();
    assert_eq!(llsns, vec![Llsn(1), Llsn(2)]);
    assert_eq!(glsns, vec![Glsn(1), Glsn(2)]);

    let executor = backup.executor(LogStreamId(1)).unwrap();
    assert!(wait_until(WAIT, || executor.metadata().local_high_watermark.glsn == Glsn(2)).await);
    let entry = executor.storage().read(ReadAt::Glsn(Glsn(2))).unwrap();
    assert_eq!((entry.llsn, entry.data), (Llsn(2), b"b".to_vec()));

    let more = primary
        .append(TOPIC, LogStreamId(1), vec![b"c".to_vec()])
        .await
        .unwrap();
    assert_eq!(more[0].glsn, Glsn(3));
    let mr = cluster.leader().await;
    assert_eq!(mr.get_last_committed(LogStreamId(1)), Glsn(3));

    admin.close();
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn log_streams_of_one_topic_share_the_global_order() {
    let mut cluster = TestCluster::new(2);
    let admin = two_node_log_streams(&mut cluster, &[1, 2]).await;
    let primary = cluster.storage_nodes[&StorageNodeId(1)].clone();

    let first = primary
        .append(TOPIC, LogStreamId(1), vec![b"x".to_vec()])
        .await
        .unwrap();
    let second = primary
        .append(TOPIC, LogStreamId(2), vec![b"y".to_vec()])
        .await
        .unwrap();
    assert_eq!(first[0].llsn, Llsn(1));
    assert_eq!(second[0].llsn, Llsn(1));
    assert!(second[0].glsn > first[0].glsn);

    let backup = cluster.storage_nodes[&StorageNodeId(2)].executor(LogStreamId(1)).unwrap();
    assert!(wait_until(WAIT, || backup.metadata().local_high_watermark.glsn == first[0].glsn).await);
    let outcome = admin.seal(TOPIC, LogStreamId(1)).await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.last_committed_glsn, first[0].glsn);
    let err = primary
        .append(TOPIC, LogStreamId(1), vec![b"z".to_vec()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageNodeError::Executor(ExecutorError::InvalidStatus { status: "sealed", .. })
    ));

    let third = primary
        .append(TOPIC, LogStreamId(2), vec![b"w".to_vec()])
        .await
        .unwrap();
    assert!(third[0].glsn > second[0].glsn);
    assert_eq!(
        primary.executor(LogStreamId(1)).unwrap().status(),
        LogStreamStatus::Sealed
    );

    admin.close();
    cluster.shutdown().await;
}
