//! The coordinator: singleton placement and broadcast actor.
//!
//! The coordinator keeps one [`ShardRecord`] per partition and places new
//! connections first-fit onto the first partition with spare capacity,
//! allocating a fresh partition when none has room. It does not know which
//! rooms live where, so every publish is broadcast to every partition.
//!
//! Load information is eventually consistent. `assign` optimistically bumps
//! a record's pending count; the next `report` from that partition
//! overwrites the record with its authoritative connection count.

use async_trait::async_trait;
use futures_util::future::join_all;
use roomcast_protocol::{codec, FanoutSummary, LoadReport, PartitionId, PublishRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, StorageError};
use crate::storage::Storage;

/// Default number of connections a partition is filled to.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Storage key holding the coordinator snapshot.
pub const SNAPSHOT_KEY: &str = "coordinator.shards";

/// The coordinator's view of one partition's load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    /// Partition identifier.
    pub id: PartitionId,
    /// Connections the partition last reported.
    pub live_connections: usize,
    /// Connections assigned since the last report.
    pub pending_assignments: usize,
    /// Incremented on every write to this record.
    pub version: u64,
}

impl ShardRecord {
    fn new(id: PartitionId) -> Self {
        Self {
            id,
            live_connections: 0,
            pending_assignments: 0,
            version: 0,
        }
    }

    /// Live plus pending connections.
    #[must_use]
    pub fn load(&self) -> usize {
        self.live_connections + self.pending_assignments
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CoordinatorSnapshot {
    next_sequence: u64,
    shards: Vec<ShardRecord>,
}

/// Where the coordinator sends broadcast publishes.
#[async_trait]
pub trait PartitionDirectory: Send + Sync + 'static {
    /// Deliver a publish to one partition, returning its local delivery count.
    async fn publish(
        &self,
        partition: &PartitionId,
        request: PublishRequest,
    ) -> Result<usize, RelayError>;
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum live plus pending connections per partition.
    pub capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Coordinator state. Owned exclusively by its actor task once spawned.
pub struct Coordinator {
    state: CoordinatorSnapshot,
    storage: Arc<dyn Storage>,
    directory: Arc<dyn PartitionDirectory>,
    config: CoordinatorConfig,
}

impl Coordinator {
    /// Load the coordinator from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored snapshot cannot be read or decoded.
    pub async fn load(
        storage: Arc<dyn Storage>,
        directory: Arc<dyn PartitionDirectory>,
        config: CoordinatorConfig,
    ) -> Result<Self, RelayError> {
        let state = match storage.get(SNAPSHOT_KEY).await? {
            Some(data) => codec::decode(&data).map_err(StorageError::from)?,
            None => CoordinatorSnapshot::default(),
        };

        info!(
            partitions = state.shards.len(),
            capacity = config.capacity,
            "Coordinator loaded"
        );

        Ok(Self {
            state,
            storage,
            directory,
            config,
        })
    }

    /// All partition records, in placement order.
    #[must_use]
    pub fn records(&self) -> &[ShardRecord] {
        &self.state.shards
    }

    /// Look up one partition's record.
    #[must_use]
    pub fn record(&self, id: &PartitionId) -> Option<&ShardRecord> {
        self.state.shards.iter().find(|r| &r.id == id)
    }

    /// Pick a partition for a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated table cannot be persisted; the table
    /// is left unchanged in that case.
    pub async fn assign(&mut self) -> Result<PartitionId, RelayError> {
        let capacity = self.config.capacity;
        let mut next = self.state.clone();

        let id = match next.shards.iter_mut().find(|r| r.load() < capacity) {
            Some(record) => {
                record.pending_assignments += 1;
                record.version += 1;
                record.id.clone()
            }
            None => {
                next.next_sequence += 1;
                let id = PartitionId::from_sequence(next.next_sequence);
                let mut record = ShardRecord::new(id.clone());
                record.pending_assignments = 1;
                record.version = 1;
                next.shards.push(record);
                info!(partition = %id, "Allocated new partition");
                id
            }
        };

        self.commit(next).await?;
        debug!(partition = %id, "Assigned connection");
        Ok(id)
    }

    /// Apply a partition's load report.
    ///
    /// A positive count replaces the record and clears pending assignments;
    /// zero removes the partition from the table.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated table cannot be persisted.
    pub async fn report(&mut self, report: LoadReport) -> Result<(), RelayError> {
        let mut next = self.state.clone();
        let position = next.shards.iter().position(|r| r.id == report.partition_id);

        match (report.conn_count, position) {
            (0, Some(index)) => {
                next.shards.remove(index);
                info!(partition = %report.partition_id, "Partition drained, removed");
            }
            (0, None) => return Ok(()),
            (count, Some(index)) => {
                let record = &mut next.shards[index];
                record.live_connections = count;
                record.pending_assignments = 0;
                record.version += 1;
            }
            (count, None) => {
                let mut record = ShardRecord::new(report.partition_id.clone());
                record.live_connections = count;
                record.version = 1;
                next.shards.push(record);
            }
        }

        self.commit(next).await?;
        debug!(
            partition = %report.partition_id,
            connections = report.conn_count,
            "Load report applied"
        );
        Ok(())
    }

    /// Broadcast a publish to every known partition.
    ///
    /// All partitions are contacted concurrently and every attempt is awaited;
    /// failures are logged and counted but never fail the publish.
    pub async fn publish(&self, request: PublishRequest) -> FanoutSummary {
        let attempts = self.state.shards.iter().map(|record| {
            let directory = Arc::clone(&self.directory);
            let request = request.clone();
            async move {
                let result = directory.publish(&record.id, request).await;
                (&record.id, result)
            }
        });

        let mut summary = FanoutSummary::default();
        for (partition, result) in join_all(attempts).await {
            match result {
                Ok(recipients) => {
                    summary.delivered += 1;
                    debug!(partition = %partition, recipients, "Partition published");
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(partition = %partition, room = %request.room, error = %e, "Partition missed publish");
                }
            }
        }
        summary
    }

    async fn commit(&mut self, next: CoordinatorSnapshot) -> Result<(), RelayError> {
        let data = codec::encode(&next).map_err(StorageError::from)?;
        self.storage.put(SNAPSHOT_KEY, data).await?;
        self.state = next;
        Ok(())
    }

    /// Run the coordinator on its mailbox.
    #[must_use]
    pub fn spawn(self, mailbox: CoordinatorMailbox) -> JoinHandle<()> {
        tokio::spawn(self.run(mailbox.rx))
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CoordinatorCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                CoordinatorCommand::Assign { reply } => {
                    let _ = reply.send(self.assign().await);
                }
                CoordinatorCommand::Report { report, reply } => {
                    let result = self.report(report).await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                warn!(error = %e, "Dropped load report");
                            }
                        }
                    }
                }
                CoordinatorCommand::Publish { request, reply } => {
                    let _ = reply.send(self.publish(request).await);
                }
                CoordinatorCommand::Stats { reply } => {
                    let _ = reply.send(self.state.shards.clone());
                }
            }
        }
        debug!("Coordinator mailbox closed");
    }
}

enum CoordinatorCommand {
    Assign {
        reply: oneshot::Sender<Result<PartitionId, RelayError>>,
    },
    Report {
        report: LoadReport,
        reply: Option<oneshot::Sender<Result<(), RelayError>>>,
    },
    Publish {
        request: PublishRequest,
        reply: oneshot::Sender<FanoutSummary>,
    },
    Stats {
        reply: oneshot::Sender<Vec<ShardRecord>>,
    },
}

/// Receiving end of the coordinator's mailbox, consumed by [`Coordinator::spawn`].
pub struct CoordinatorMailbox {
    rx: mpsc::UnboundedReceiver<CoordinatorCommand>,
}

#[cfg(test)]
impl CoordinatorMailbox {
    /// Connection counts of every queued fire-and-forget report.
    pub(crate) fn drain_reports(&mut self) -> Vec<usize> {
        let mut counts = Vec::new();
        while let Ok(command) = self.rx.try_recv() {
            if let CoordinatorCommand::Report { report, .. } = command {
                counts.push(report.conn_count);
            }
        }
        counts
    }
}

/// Create the coordinator's mailbox.
///
/// The handle exists before the coordinator is loaded so partitions can be
/// given a way to report back before the coordinator starts serving.
#[must_use]
pub fn mailbox() -> (CoordinatorHandle, CoordinatorMailbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CoordinatorHandle { tx }, CoordinatorMailbox { rx })
}

/// Cloneable handle to the coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CoordinatorCommand,
    ) -> Result<T, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| RelayError::ActorUnavailable("coordinator".into()))?;
        rx.await
            .map_err(|_| RelayError::ActorUnavailable("coordinator".into()))
    }

    /// Ask for a partition to place a new connection on.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator is down or cannot persist.
    pub async fn assign(&self) -> Result<PartitionId, RelayError> {
        self.request(|reply| CoordinatorCommand::Assign { reply })
            .await?
    }

    /// Send a load report and wait for it to be applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator is down or cannot persist.
    pub async fn report(&self, report: LoadReport) -> Result<(), RelayError> {
        self.request(|reply| CoordinatorCommand::Report {
            report,
            reply: Some(reply),
        })
        .await?
    }

    /// Send a load report without waiting for it to be applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator's mailbox is closed.
    pub fn report_nowait(&self, report: LoadReport) -> Result<(), RelayError> {
        self.tx
            .send(CoordinatorCommand::Report {
                report,
                reply: None,
            })
            .map_err(|_| RelayError::ActorUnavailable("coordinator".into()))
    }

    /// Broadcast a publish to every partition.
    ///
    /// # Errors
    ///
    /// Returns an error only if the coordinator is down.
    pub async fn publish(&self, request: PublishRequest) -> Result<FanoutSummary, RelayError> {
        self.request(|reply| CoordinatorCommand::Publish { request, reply })
            .await
    }

    /// Snapshot of the partition table.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator is down.
    pub async fn stats(&self) -> Result<Vec<ShardRecord>, RelayError> {
        self.request(|reply| CoordinatorCommand::Stats { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use bytes::Bytes;
    use dashmap::DashMap;
    use roomcast_protocol::RoomName;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records publishes and fails for configured partitions.
    #[derive(Default)]
    struct RecordingDirectory {
        published: DashMap<PartitionId, Vec<PublishRequest>>,
        failing: DashMap<PartitionId, ()>,
    }

    #[async_trait]
    impl PartitionDirectory for RecordingDirectory {
        async fn publish(
            &self,
            partition: &PartitionId,
            request: PublishRequest,
        ) -> Result<usize, RelayError> {
            if self.failing.contains_key(partition) {
                return Err(RelayError::ActorUnavailable(format!("partition {partition}")));
            }
            self.published
                .entry(partition.clone())
                .or_default()
                .push(request);
            Ok(0)
        }
    }

    /// Memory storage whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        down: AtomicBool,
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("disk full".into()));
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }
    }

    async fn coordinator_with(
        storage: Arc<dyn Storage>,
        capacity: usize,
    ) -> (Coordinator, Arc<RecordingDirectory>) {
        let directory = Arc::new(RecordingDirectory::default());
        let coordinator = Coordinator::load(
            storage,
            directory.clone(),
            CoordinatorConfig { capacity },
        )
        .await
        .unwrap();
        (coordinator, directory)
    }

    #[tokio::test]
    async fn test_assign_report_assign_scenario() {
        let (mut coordinator, _) = coordinator_with(Arc::new(MemoryStorage::new()), 1000).await;

        let p1 = coordinator.assign().await.unwrap();
        assert_eq!(p1.as_str(), "p1");
        let record = coordinator.record(&p1).unwrap();
        assert_eq!((record.live_connections, record.pending_assignments), (0, 1));

        coordinator.report(LoadReport::new(p1.clone(), 5)).await.unwrap();
        let record = coordinator.record(&p1).unwrap();
        assert_eq!((record.live_connections, record.pending_assignments), (5, 0));

        assert_eq!(coordinator.assign().await.unwrap(), p1);
        let record = coordinator.record(&p1).unwrap();
        assert_eq!((record.live_connections, record.pending_assignments), (5, 1));
    }

    #[tokio::test]
    async fn test_assign_never_exceeds_capacity() {
        let (mut coordinator, _) = coordinator_with(Arc::new(MemoryStorage::new()), 3).await;

        for _ in 0..10 {
            let id = coordinator.assign().await.unwrap();
            assert!(coordinator.record(&id).unwrap().load() <= 3);
        }
        assert_eq!(coordinator.records().len(), 4);
    }

    #[tokio::test]
    async fn test_first_fit_prefers_earliest_partition() {
        let (mut coordinator, _) = coordinator_with(Arc::new(MemoryStorage::new()), 2).await;

        let p1 = coordinator.assign().await.unwrap();
        coordinator.assign().await.unwrap();
        let p2 = coordinator.assign().await.unwrap();
        assert_ne!(p1, p2);

        // p1 drains to one connection and has room again
        coordinator.report(LoadReport::new(p1.clone(), 1)).await.unwrap();
        assert_eq!(coordinator.assign().await.unwrap(), p1);
    }

    #[tokio::test]
    async fn test_report_zero_removes_and_ids_are_not_reused() {
        let (mut coordinator, _) = coordinator_with(Arc::new(MemoryStorage::new()), 1000).await;

        let p1 = coordinator.assign().await.unwrap();
        coordinator.report(LoadReport::new(p1.clone(), 0)).await.unwrap();
        assert!(coordinator.record(&p1).is_none());

        let next = coordinator.assign().await.unwrap();
        assert_ne!(next, p1);
    }

    #[tokio::test]
    async fn test_report_for_unknown_partition_inserts() {
        let (mut coordinator, _) = coordinator_with(Arc::new(MemoryStorage::new()), 1000).await;

        let id = PartitionId::new("p9");
        coordinator.report(LoadReport::new(id.clone(), 4)).await.unwrap();
        assert_eq!(coordinator.record(&id).unwrap().live_connections, 4);
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (mut coordinator, _) = coordinator_with(Arc::clone(&storage), 1000).await;
        let p1 = coordinator.assign().await.unwrap();
        coordinator.report(LoadReport::new(p1.clone(), 0)).await.unwrap();
        drop(coordinator);

        let (mut reloaded, _) = coordinator_with(storage, 1000).await;
        assert!(reloaded.records().is_empty());
        assert_eq!(reloaded.assign().await.unwrap().as_str(), "p2");
    }

    #[tokio::test]
    async fn test_storage_failure_fails_assign_and_rolls_back() {
        let storage = Arc::new(FlakyStorage::default());
        let (mut coordinator, _) =
            coordinator_with(storage.clone() as Arc<dyn Storage>, 1000).await;
        let p1 = coordinator.assign().await.unwrap();

        storage.down.store(true, Ordering::SeqCst);
        assert!(matches!(
            coordinator.assign().await,
            Err(RelayError::Storage(_))
        ));
        assert_eq!(coordinator.record(&p1).unwrap().pending_assignments, 1);

        storage.down.store(false, Ordering::SeqCst);
        coordinator.assign().await.unwrap();
        assert_eq!(coordinator.record(&p1).unwrap().pending_assignments, 2);
    }

    #[tokio::test]
    async fn test_publish_broadcasts_and_tolerates_failures() {
        let (mut coordinator, directory) =
            coordinator_with(Arc::new(MemoryStorage::new()), 1).await;
        let p1 = coordinator.assign().await.unwrap();
        let p2 = coordinator.assign().await.unwrap();
        let p3 = coordinator.assign().await.unwrap();
        directory.failing.insert(p2.clone(), ());

        let request = PublishRequest::new(RoomName::derive("c", "r").unwrap(), "hello");
        let summary = coordinator.publish(request.clone()).await;

        assert_eq!(summary, FanoutSummary { delivered: 2, failed: 1 });
        assert_eq!(directory.published.get(&p1).unwrap().as_slice(), &[request.clone()]);
        assert_eq!(directory.published.get(&p3).unwrap().as_slice(), &[request]);
        assert!(directory.published.get(&p2).is_none());
    }

    #[tokio::test]
    async fn test_actor_handle_roundtrip() {
        let (handle, mailbox) = mailbox();
        let (coordinator, _) = coordinator_with(Arc::new(MemoryStorage::new()), 1000).await;
        let _task = coordinator.spawn(mailbox);

        let id = handle.assign().await.unwrap();
        handle.report_nowait(LoadReport::new(id.clone(), 7)).unwrap();

        let records = handle.stats().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].live_connections, 7);
        assert_eq!(records[0].pending_assignments, 0);
    }
}
