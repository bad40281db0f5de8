//! Wiring of the coordinator and the partition registry.
//!
//! A [`Cluster`] is what a host process talks to: it places connections,
//! forwards client messages, and broadcasts publishes.

use roomcast_protocol::{FanoutSummary, PartitionId, PublishRequest};
use roomcast_transport::{close_code, Connection, ConnectionId};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::{self, Coordinator, CoordinatorConfig, CoordinatorHandle, ShardRecord};
use crate::error::RelayError;
use crate::partition::PartitionConfig;
use crate::registry::PartitionRegistry;
use crate::storage::Storage;

/// Cluster configuration.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Coordinator settings.
    pub coordinator: CoordinatorConfig,
    /// Settings shared by every partition.
    pub partition: PartitionConfig,
}

/// A running coordinator plus its partitions.
pub struct Cluster {
    coordinator: CoordinatorHandle,
    registry: Arc<PartitionRegistry>,
    task: JoinHandle<()>,
}

impl Cluster {
    /// Load the coordinator from `storage` and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator snapshot cannot be loaded.
    pub async fn start(storage: Arc<dyn Storage>, config: ClusterConfig) -> Result<Self, RelayError> {
        let (handle, mailbox) = coordinator::mailbox();
        let registry = Arc::new(PartitionRegistry::new(handle.clone(), config.partition));
        let coordinator = Coordinator::load(storage, registry.clone(), config.coordinator).await?;
        let task = coordinator.spawn(mailbox);

        info!("Cluster started");
        Ok(Self {
            coordinator: handle,
            registry,
            task,
        })
    }

    /// Place a new connection on a partition and open its session.
    ///
    /// # Errors
    ///
    /// Returns an error if assignment or the partition's accept fails.
    pub async fn connect(&self, connection: Arc<dyn Connection>) -> Result<PartitionId, RelayError> {
        let partition = self.coordinator.assign().await?;
        debug!(partition = %partition, connection = %connection.id(), "Assigned connection");
        self.registry.accept(&partition, connection).await?;
        Ok(partition)
    }

    /// Forward a client text message to the connection's partition.
    ///
    /// A connection the partition does not know is closed with 1011.
    ///
    /// # Errors
    ///
    /// Returns the partition's error for the message.
    pub async fn message(
        &self,
        partition: &PartitionId,
        connection: &dyn Connection,
        text: &str,
    ) -> Result<(), RelayError> {
        let result = match self.registry.lookup(partition) {
            Some(handle) => handle.message(connection.id(), text).await,
            None => Err(RelayError::UntrackedSession(connection.id().clone())),
        };

        if let Err(RelayError::UntrackedSession(_)) = &result {
            warn!(partition = %partition, connection = %connection.id(), "Message for untracked session");
            if let Err(e) = connection.close(close_code::INTERNAL, "WebSocket broken.").await {
                debug!(connection = %connection.id(), error = %e, "Close failed");
            }
        }
        result
    }

    /// Signal that a connection closed or errored.
    pub async fn disconnect(&self, partition: &PartitionId, connection: &ConnectionId) {
        self.registry.release(partition, connection).await;
    }

    /// Broadcast a publish to every partition.
    ///
    /// # Errors
    ///
    /// Returns an error only if the coordinator is down.
    pub async fn publish(&self, request: PublishRequest) -> Result<FanoutSummary, RelayError> {
        self.coordinator.publish(request).await
    }

    /// The coordinator's partition table.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator is down.
    pub async fn stats(&self) -> Result<Vec<ShardRecord>, RelayError> {
        self.coordinator.stats().await
    }

    /// Handle to the coordinator actor.
    #[must_use]
    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    /// The partition registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PartitionRegistry> {
        &self.registry
    }

    /// Stop every partition and the coordinator.
    pub async fn shutdown(self) {
        self.registry.shutdown().await;
        self.task.abort();
        info!("Cluster stopped");
    }
}
