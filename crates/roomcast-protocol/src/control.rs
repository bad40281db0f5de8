//! Control-plane messages between the coordinator and its partitions.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::room::RoomName;

/// Opaque partition identifier handed out by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    /// Create a partition ID from an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the identifier for the `seq`-th partition ever allocated.
    #[must_use]
    pub fn from_sequence(seq: u64) -> Self {
        Self(format!("p{seq}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Load report sent by a partition to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    /// Reporting partition.
    pub partition_id: PartitionId,
    /// Number of sessions currently open on the partition.
    pub conn_count: usize,
}

impl LoadReport {
    /// Create a new load report.
    #[must_use]
    pub fn new(partition_id: PartitionId, conn_count: usize) -> Self {
        Self {
            partition_id,
            conn_count,
        }
    }
}

/// A message to be fanned out to the subscribers of one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Target room.
    pub room: RoomName,
    /// Opaque payload, forwarded to subscribers verbatim.
    pub payload: Bytes,
}

impl PublishRequest {
    /// Create a new publish request.
    #[must_use]
    pub fn new(room: RoomName, payload: impl Into<Bytes>) -> Self {
        Self {
            room,
            payload: payload.into(),
        }
    }
}

/// Outcome of broadcasting a publish to every partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutSummary {
    /// Partitions that acknowledged the publish.
    pub delivered: usize,
    /// Partitions that did not.
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_id_from_sequence() {
        assert_eq!(PartitionId::from_sequence(1).as_str(), "p1");
        assert_ne!(PartitionId::from_sequence(1), PartitionId::from_sequence(2));
    }

    #[test]
    fn test_load_report_wire_names() {
        let report = LoadReport::new(PartitionId::new("p7"), 12);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["partitionId"], "p7");
        assert_eq!(json["connCount"], 12);
    }
}
