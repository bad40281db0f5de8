//! Shared fixtures for the Roomcast benchmarks.

use bytes::Bytes;
use roomcast_core::coordinator::{self, CoordinatorMailbox};
use roomcast_core::{Cluster, ClusterConfig, CoordinatorConfig, MemoryStorage, Partition, PartitionConfig};
use roomcast_protocol::{PartitionId, RoomName};
use roomcast_transport::local::{self, LocalReceiver};
use roomcast_transport::Connection;
use std::sync::Arc;

/// Cluster used by every benchmark room.
pub const BENCH_CLUSTER: &str = "bench";

/// Build a multi-threaded runtime for driving async code from criterion.
///
/// # Panics
///
/// Panics if the runtime cannot be created.
#[must_use]
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
}

/// Room `name` in the benchmark cluster.
///
/// # Panics
///
/// Panics if `name` does not form a valid room.
#[must_use]
pub fn room(name: &str) -> RoomName {
    RoomName::derive(BENCH_CLUSTER, name).expect("invalid benchmark room")
}

/// A payload of `size` bytes.
#[must_use]
pub fn payload(size: usize) -> Bytes {
    Bytes::from(vec![b'x'; size])
}

/// A standalone partition with subscribers on one room.
pub struct PartitionFixture {
    /// The partition under test.
    pub partition: Partition,
    /// One receiver per subscriber.
    pub receivers: Vec<LocalReceiver>,
    // Keeps the partition's load reports deliverable.
    _mailbox: CoordinatorMailbox,
}

impl PartitionFixture {
    /// Build a partition with `subscribers` connections joined to `room`.
    ///
    /// # Panics
    ///
    /// Panics if a subscriber cannot be accepted.
    pub async fn new(room: &RoomName, subscribers: usize) -> Self {
        let (handle, mailbox) = coordinator::mailbox();
        let mut partition = Partition::new(PartitionId::new("bench"), handle, PartitionConfig::default());

        let mut receivers = Vec::with_capacity(subscribers);
        for i in 0..subscribers {
            let (conn, rx) = local::pair_with_id(format!("conn-{i}"));
            partition.accept(conn.clone()).await.expect("accept failed");
            partition
                .subscribe(conn.id(), room.clone())
                .await
                .expect("subscribe failed");
            receivers.push(rx);
        }

        Self {
            partition,
            receivers,
            _mailbox: mailbox,
        }
    }

    /// Discard everything delivered so far; returns the message count.
    pub fn drain(&mut self) -> usize {
        self.receivers.iter_mut().map(|rx| rx.drain().len()).sum()
    }
}

/// Start an in-memory cluster and subscribe `subscribers` local connections
/// to `room`, spreading them over partitions of `capacity` connections.
///
/// # Panics
///
/// Panics if the cluster cannot be started or a subscriber cannot join.
pub async fn subscribed_cluster(
    room: &RoomName,
    subscribers: usize,
    capacity: usize,
) -> (Cluster, Vec<LocalReceiver>) {
    let config = ClusterConfig {
        coordinator: CoordinatorConfig { capacity },
        ..ClusterConfig::default()
    };
    let cluster = Cluster::start(Arc::new(MemoryStorage::new()), config)
        .await
        .expect("cluster failed to start");

    let (cluster_name, room_name) = room
        .as_str()
        .split_once(roomcast_protocol::ROOM_SEPARATOR)
        .expect("room without separator");
    let subscribe = format!(
        r#"{{"event":"subscribe","cluster":"{cluster_name}","room":"{room_name}"}}"#
    );

    let mut receivers = Vec::with_capacity(subscribers);
    for _ in 0..subscribers {
        let (conn, rx) = local::pair();
        let partition = cluster.connect(conn.clone()).await.expect("connect failed");
        cluster
            .message(&partition, conn.as_ref(), &subscribe)
            .await
            .expect("subscribe failed");
        receivers.push(rx);
    }

    (cluster, receivers)
}
