//! Client-plane events and ingress bodies.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;
use crate::room::RoomName;

/// An event sent by a client over its socket.
///
/// Events are tagged by their `event` field; any tag not listed here is
/// rejected when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ClientEvent {
    /// Join a room and receive its latest message.
    Subscribe {
        /// Tenant cluster identifier.
        cluster: String,
        /// Room identifier within the cluster.
        room: String,
    },
}

impl ClientEvent {
    /// Create a new Subscribe event.
    #[must_use]
    pub fn subscribe(cluster: impl Into<String>, room: impl Into<String>) -> Self {
        ClientEvent::Subscribe {
            cluster: cluster.into(),
            room: room.into(),
        }
    }

    /// The derived room this event targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid.
    pub fn room(&self) -> Result<RoomName, ProtocolError> {
        match self {
            ClientEvent::Subscribe { cluster, room } => RoomName::derive(cluster, room),
        }
    }
}

/// Body of an ingress `POST /publish` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressPublish {
    /// Tenant cluster identifier.
    pub cluster: String,
    /// Room identifier within the cluster.
    pub room: String,
    /// Application data; opaque to the relay.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl IngressPublish {
    /// The derived room this publish targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid.
    pub fn room(&self) -> Result<RoomName, ProtocolError> {
        RoomName::derive(&self.cluster, &self.room)
    }
}

/// Error notice sent to a socket whose session could not be set up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    /// Human-readable reason.
    pub error: String,
}
