//! Partition registry: the in-process host for partition actors.
//!
//! The registry maps partition ids to running actors and keeps every
//! connection it has handed to a partition. Partitions are spawned on first
//! reference; a partition whose actor has stopped is re-activated from the
//! connections it still hosts. A partition whose last hosted connection is
//! released is stopped and dropped from the registry.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use roomcast_protocol::{PartitionId, PublishRequest};
use roomcast_transport::{Connection, ConnectionId};
use std::sync::Arc;
use tracing::{debug, info};

use crate::coordinator::{CoordinatorHandle, PartitionDirectory};
use crate::error::RelayError;
use crate::partition::{Partition, PartitionConfig, PartitionHandle};

type Hosted = DashMap<ConnectionId, Arc<dyn Connection>>;

/// Resolves partition ids to running partition actors.
pub struct PartitionRegistry {
    partitions: DashMap<PartitionId, PartitionHandle>,
    hosted: DashMap<PartitionId, Hosted>,
    coordinator: CoordinatorHandle,
    config: PartitionConfig,
}

impl PartitionRegistry {
    /// Create an empty registry. Partitions report load to `coordinator`.
    #[must_use]
    pub fn new(coordinator: CoordinatorHandle, config: PartitionConfig) -> Self {
        Self {
            partitions: DashMap::new(),
            hosted: DashMap::new(),
            coordinator,
            config,
        }
    }

    /// Get the running actor for a partition, spawning or re-activating it.
    pub fn resolve(&self, id: &PartitionId) -> PartitionHandle {
        match self.partitions.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    let handle = self.activate(id);
                    entry.insert(handle.clone());
                    handle
                } else {
                    entry.get().clone()
                }
            }
            Entry::Vacant(entry) => entry.insert(self.activate(id)).clone(),
        }
    }

    /// Get the actor for a partition that is running or still hosts
    /// connections. Unknown partitions are not spawned.
    pub fn lookup(&self, id: &PartitionId) -> Option<PartitionHandle> {
        if self.partitions.contains_key(id) || self.hosted.contains_key(id) {
            Some(self.resolve(id))
        } else {
            None
        }
    }

    fn activate(&self, id: &PartitionId) -> PartitionHandle {
        let connections: Vec<Arc<dyn Connection>> = self
            .hosted
            .get(id)
            .map(|hosted| hosted.iter().map(|c| Arc::clone(c.value())).collect())
            .unwrap_or_default();

        let partition = if connections.is_empty() {
            debug!(partition = %id, "Spawning partition");
            Partition::new(id.clone(), self.coordinator.clone(), self.config.clone())
        } else {
            info!(partition = %id, connections = connections.len(), "Re-activating partition");
            Partition::restore(
                id.clone(),
                connections,
                self.coordinator.clone(),
                self.config.clone(),
            )
        };

        let (handle, _task) = partition.spawn();
        handle
    }

    /// Host a connection on a partition and open its session there.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition rejects the connection; it is not
    /// hosted in that case.
    pub async fn accept(
        &self,
        id: &PartitionId,
        connection: Arc<dyn Connection>,
    ) -> Result<PartitionHandle, RelayError> {
        let connection_id = connection.id().clone();
        self.hosted
            .entry(id.clone())
            .or_default()
            .insert(connection_id.clone(), Arc::clone(&connection));

        let handle = self.resolve(id);
        if let Err(e) = handle.accept(connection).await {
            self.forget(id, &connection_id);
            return Err(e);
        }
        Ok(handle)
    }

    /// Close a hosted connection's session and stop hosting it.
    ///
    /// Releasing the last hosted connection stops the partition; this returns
    /// once the actor has exited, so its final load report is already queued.
    pub async fn release(&self, id: &PartitionId, connection_id: &ConnectionId) {
        self.forget(id, connection_id);
        let Some(handle) = self.partitions.get(id).map(|h| h.clone()) else {
            return;
        };
        if let Err(e) = handle.close(connection_id).await {
            debug!(partition = %id, connection = %connection_id, error = %e, "Release after partition stopped");
        }
        self.retire(id).await;
    }

    async fn retire(&self, id: &PartitionId) {
        // Checked under the partitions lock so a concurrent accept either
        // keeps this actor or spawns a fresh one.
        let Some((_, handle)) = self
            .partitions
            .remove_if(id, |_, _| !self.hosted.contains_key(id))
        else {
            return;
        };
        debug!(partition = %id, "Retiring drained partition");
        handle.shutdown().await;
        handle.stopped().await;
    }

    fn forget(&self, id: &PartitionId, connection_id: &ConnectionId) {
        if let Some(hosted) = self.hosted.get(id) {
            hosted.remove(connection_id);
        }
        self.hosted.remove_if(id, |_, hosted| hosted.is_empty());
    }

    /// Number of connections hosted on a partition.
    #[must_use]
    pub fn hosted_count(&self, id: &PartitionId) -> usize {
        self.hosted.get(id).map_or(0, |hosted| hosted.len())
    }

    /// Number of partition actors known to the registry.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Stop every partition actor. Hosted connections are left open.
    pub async fn shutdown(&self) {
        let handles: Vec<PartitionHandle> =
            self.partitions.iter().map(|h| h.value().clone()).collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

#[async_trait]
impl PartitionDirectory for PartitionRegistry {
    async fn publish(
        &self,
        partition: &PartitionId,
        request: PublishRequest,
    ) -> Result<usize, RelayError> {
        match self.lookup(partition) {
            Some(handle) => handle.publish(request).await,
            // Retired: nobody left to deliver to.
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator;
    use roomcast_protocol::RoomName;
    use roomcast_transport::local;

    fn registry() -> (PartitionRegistry, coordinator::CoordinatorMailbox) {
        let (handle, mailbox) = coordinator::mailbox();
        (
            PartitionRegistry::new(handle, PartitionConfig::default()),
            mailbox,
        )
    }

    #[tokio::test]
    async fn test_resolve_reuses_running_partition() {
        let (registry, _mailbox) = registry();
        let id = PartitionId::new("p1");

        let first = registry.resolve(&id);
        let second = registry.resolve(&id);

        assert_eq!(first.id(), second.id());
        assert_eq!(registry.partition_count(), 1);
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn test_accept_and_release() {
        let (registry, _mailbox) = registry();
        let id = PartitionId::new("p1");
        let (conn, _rx) = local::pair_with_id("conn-1");

        let handle = registry.accept(&id, conn.clone()).await.unwrap();
        assert_eq!(registry.hosted_count(&id), 1);
        assert_eq!(handle.stats().await.unwrap().sessions, 1);

        registry.release(&id, conn.id()).await;
        assert_eq!(registry.hosted_count(&id), 0);
        assert_eq!(registry.partition_count(), 0);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_release_keeps_partition_with_other_connections() {
        let (registry, mut mailbox) = registry();
        let id = PartitionId::new("p1");
        let (first, _rx1) = local::pair_with_id("conn-1");
        let (second, _rx2) = local::pair_with_id("conn-2");
        registry.accept(&id, first.clone()).await.unwrap();
        let handle = registry.accept(&id, second).await.unwrap();

        registry.release(&id, first.id()).await;

        assert_eq!(registry.partition_count(), 1);
        assert_eq!(handle.stats().await.unwrap().sessions, 1);
        assert_eq!(mailbox.drain_reports(), vec![1, 2, 1]);
    }

    #[tokio::test]
    async fn test_release_of_last_connection_queues_zero_report() {
        let (registry, mut mailbox) = registry();
        let id = PartitionId::new("p1");
        let (conn, _rx) = local::pair_with_id("conn-1");
        registry.accept(&id, conn.clone()).await.unwrap();

        registry.release(&id, conn.id()).await;

        assert_eq!(mailbox.drain_reports(), vec![1, 0]);
    }

    #[tokio::test]
    async fn test_lookup_does_not_spawn_unknown_partition() {
        let (registry, _mailbox) = registry();
        let id = PartitionId::new("p9");

        assert!(registry.lookup(&id).is_none());
        let delivered = PartitionDirectory::publish(
            &registry,
            &id,
            PublishRequest::new(RoomName::derive("acme", "feed").unwrap(), "x"),
        )
        .await
        .unwrap();

        assert_eq!(delivered, 0);
        assert_eq!(registry.partition_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_connection_is_not_hosted() {
        let (registry, _mailbox) = registry();
        let id = PartitionId::new("p1");
        let (conn, _rx) = local::pair_with_id("conn-1");
        conn.fail_attachments(true);

        assert!(registry.accept(&id, conn).await.is_err());
        assert_eq!(registry.hosted_count(&id), 0);
    }

    #[tokio::test]
    async fn test_stopped_partition_is_reactivated_with_sessions() {
        let (registry, _mailbox) = registry();
        let id = PartitionId::new("p1");
        let (conn, mut rx) = local::pair_with_id("conn-1");
        let handle = registry.accept(&id, conn.clone()).await.unwrap();
        handle
            .message(conn.id(), r#"{"event":"subscribe","cluster":"acme","room":"feed"}"#)
            .await
            .unwrap();

        handle.shutdown().await;
        while !handle.is_closed() {
            tokio::task::yield_now().await;
        }

        let room = RoomName::derive("acme", "feed").unwrap();
        let delivered = PartitionDirectory::publish(
            &registry,
            &id,
            PublishRequest::new(room, "after restart"),
        )
        .await
        .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), "after restart");
        assert!(!registry.resolve(&id).is_closed());
    }
}
