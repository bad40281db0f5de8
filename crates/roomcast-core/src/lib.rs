//! # roomcast-core
//!
//! Coordinator and partition actors for the Roomcast relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Coordinator** - Places connections on partitions and broadcasts publishes
//! - **Partition** - Holds sessions, room membership, and the last message per room
//! - **Registry** - Spawns and re-activates partition actors
//! - **Storage** - Durable key/value backends for actor state
//!
//! ## Architecture
//!
//! ```text
//!                      assign / publish
//! ┌─────────────┐     ┌─────────────┐  broadcast  ┌─────────────┐
//! │    Host     │────▶│ Coordinator │────────────▶│  Partition  │──▶ subscribers
//! └─────────────┘     └─────────────┘             └─────────────┘
//!        │                   ▲        load report        │
//!        │                   └───────────────────────────┘
//!        │  accept / message / close                     ▲
//!        └───────────────────────────────────────────────┘
//! ```

pub mod cluster;
pub mod coordinator;
pub mod error;
pub mod partition;
pub mod registry;
pub mod room;
pub mod storage;

pub use cluster::{Cluster, ClusterConfig};
pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorHandle, PartitionDirectory, ShardRecord,
    DEFAULT_CAPACITY,
};
pub use error::{RelayError, StorageError};
pub use partition::{Partition, PartitionConfig, PartitionHandle, PartitionStats, SessionAttachment};
pub use registry::PartitionRegistry;
pub use room::Room;
pub use storage::{FileStorage, MemoryStorage, Storage};
