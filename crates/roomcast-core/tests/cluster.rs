//! End-to-end tests through the coordinator, registry, and partitions.

use bytes::Bytes;
use roomcast_core::{Cluster, ClusterConfig, CoordinatorConfig, FileStorage, MemoryStorage, Storage};
use roomcast_protocol::{PartitionId, PublishRequest, RoomName};
use roomcast_transport::{close_code, local, Connection};
use std::sync::Arc;

fn subscribe(cluster: &str, room: &str) -> String {
    format!(r#"{{"event":"subscribe","cluster":"{cluster}","room":"{room}"}}"#)
}

async fn start(capacity: usize) -> Cluster {
    let config = ClusterConfig {
        coordinator: CoordinatorConfig { capacity },
        ..ClusterConfig::default()
    };
    Cluster::start(Arc::new(MemoryStorage::new()), config)
        .await
        .unwrap()
}

#[tokio::test]
async fn publish_reaches_subscribers_on_every_partition() {
    let cluster = start(2).await;
    let mut receivers = Vec::new();

    for i in 0..3 {
        let (conn, rx) = local::pair_with_id(format!("conn-{i}"));
        let partition = cluster.connect(conn.clone()).await.unwrap();
        cluster
            .message(&partition, conn.as_ref(), &subscribe("acme", "scores"))
            .await
            .unwrap();
        receivers.push(rx);
    }

    let room = RoomName::derive("acme", "scores").unwrap();
    let summary = cluster
        .publish(PublishRequest::new(room, r#"{"goal":1}"#))
        .await
        .unwrap();

    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.failed, 0);
    for rx in &mut receivers {
        assert_eq!(rx.recv().await.unwrap(), r#"{"goal":1}"#);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn late_subscriber_gets_cached_message_first() {
    let cluster = start(10).await;
    let room = RoomName::derive("acme", "news").unwrap();

    let (first, _first_rx) = local::pair_with_id("conn-1");
    let partition = cluster.connect(first).await.unwrap();
    cluster
        .publish(PublishRequest::new(room.clone(), "M"))
        .await
        .unwrap();

    let (late, mut rx) = local::pair_with_id("conn-2");
    assert_eq!(cluster.connect(late.clone()).await.unwrap(), partition);
    cluster
        .message(&partition, late.as_ref(), &subscribe("acme", "news"))
        .await
        .unwrap();
    cluster
        .publish(PublishRequest::new(room, "N"))
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), "M");
    assert_eq!(rx.recv().await.unwrap(), "N");
    assert!(rx.try_recv().is_none());
}

#[tokio::test]
async fn disconnect_removes_subscriber_and_reports_load() {
    let cluster = start(10).await;
    let (conn, mut rx) = local::pair_with_id("conn-1");
    let partition = cluster.connect(conn.clone()).await.unwrap();
    cluster
        .message(&partition, conn.as_ref(), &subscribe("acme", "room"))
        .await
        .unwrap();

    cluster.disconnect(&partition, conn.id()).await;
    let room = RoomName::derive("acme", "room").unwrap();
    let summary = cluster
        .publish(PublishRequest::new(room, Bytes::from_static(b"gone")))
        .await
        .unwrap();

    // The zero-connection report removed the partition from the table.
    assert_eq!(summary.delivered, 0);
    assert!(rx.try_recv().is_none());
    assert!(cluster.stats().await.unwrap().is_empty());
    assert_eq!(cluster.registry().hosted_count(&partition), 0);
    assert_eq!(cluster.registry().partition_count(), 0);
}

#[tokio::test]
async fn drained_partitions_are_retired() {
    let cluster = start(10).await;

    for i in 0..5 {
        let (conn, _rx) = local::pair_with_id(format!("conn-{i}"));
        let partition = cluster.connect(conn.clone()).await.unwrap();
        assert_eq!(partition.as_str(), format!("p{}", i + 1));
        assert_eq!(cluster.registry().partition_count(), 1);

        cluster.disconnect(&partition, conn.id()).await;

        assert!(cluster.stats().await.unwrap().is_empty());
        assert_eq!(cluster.registry().partition_count(), 0);
    }
}

#[tokio::test]
async fn untracked_connection_is_closed_with_internal_error() {
    let cluster = start(10).await;
    let (conn, _rx) = local::pair_with_id("stranger");

    let result = cluster
        .message(&PartitionId::new("p1"), conn.as_ref(), &subscribe("a", "b"))
        .await;

    assert!(result.is_err());
    let (code, reason) = conn.closed_with().unwrap();
    assert_eq!(code, close_code::INTERNAL);
    assert_eq!(reason, "WebSocket broken.");
    assert_eq!(cluster.registry().partition_count(), 0);
}

#[tokio::test]
async fn partition_ids_survive_coordinator_restart() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path()).await.unwrap());

    let cluster = Cluster::start(storage.clone(), ClusterConfig::default())
        .await
        .unwrap();
    let (conn, _rx) = local::pair_with_id("conn-1");
    let first = cluster.connect(conn.clone()).await.unwrap();
    cluster.disconnect(&first, conn.id()).await;
    assert!(cluster.stats().await.unwrap().is_empty());
    cluster.shutdown().await;

    let cluster = Cluster::start(storage, ClusterConfig::default())
        .await
        .unwrap();
    let (conn, _rx) = local::pair_with_id("conn-2");
    let second = cluster.connect(conn).await.unwrap();

    assert_eq!(first.as_str(), "p1");
    assert_eq!(second.as_str(), "p2");
}
