//! Room state held by a partition.
//!
//! A room tracks which local connections are subscribed and remembers the
//! most recent payload published to it, so late subscribers can be caught up
//! immediately.

use bytes::Bytes;
use roomcast_protocol::RoomName;
use roomcast_transport::ConnectionId;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A room on one partition.
#[derive(Debug)]
pub struct Room {
    /// Room name.
    name: RoomName,
    /// Set of subscribed connection IDs.
    subscribers: HashSet<ConnectionId>,
    /// Most recently published payload.
    last_message: Option<Bytes>,
    /// When the room was created or last published to.
    last_activity: Instant,
}

/// Current time on the runtime clock, so a paused test clock applies.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl Room {
    /// Create a new, empty room.
    #[must_use]
    pub fn new(name: RoomName) -> Self {
        Self {
            name,
            subscribers: HashSet::new(),
            last_message: None,
            last_activity: now(),
        }
    }

    /// Get the room name.
    #[must_use]
    pub fn name(&self) -> &RoomName {
        &self.name
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a connection is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &ConnectionId) -> bool {
        self.subscribers.contains(connection_id)
    }

    /// Subscribe a connection to this room.
    ///
    /// Returns `true` if the connection was not already subscribed.
    pub fn subscribe(&mut self, connection_id: ConnectionId) -> bool {
        let added = self.subscribers.insert(connection_id);
        if added {
            debug!(room = %self.name, subscribers = self.subscribers.len(), "Connection subscribed");
        }
        added
    }

    /// Unsubscribe a connection from this room.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.subscribers.remove(connection_id);
        if removed {
            debug!(room = %self.name, connection = %connection_id, "Connection unsubscribed");
        }
        removed
    }

    /// Replace the cached payload.
    pub fn cache(&mut self, payload: Bytes, at: Instant) {
        trace!(room = %self.name, bytes = payload.len(), "Caching message");
        self.last_message = Some(payload);
        self.last_activity = at;
    }

    /// The cached payload, if anything was ever published.
    #[must_use]
    pub fn last_message(&self) -> Option<&Bytes> {
        self.last_message.as_ref()
    }

    /// Iterate over subscriber IDs.
    pub fn subscribers(&self) -> impl Iterator<Item = &ConnectionId> {
        self.subscribers.iter()
    }

    /// Check if the room has no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// An idle room has no subscribers and has seen no publish within `ttl`.
    #[must_use]
    pub fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        self.is_empty() && now.saturating_duration_since(self.last_activity) >= ttl
    }
}
