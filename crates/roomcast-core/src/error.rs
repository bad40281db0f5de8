//! Error taxonomy for the relay.

use roomcast_protocol::ProtocolError;
use roomcast_transport::{ConnectionId, TransportError};
use thiserror::Error;

/// Durable-state errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store failed to read or write a key.
    #[error("I/O error on key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Key cannot be mapped onto the backing store.
    #[error("Invalid storage key: '{0}'")]
    InvalidKey(String),

    /// A snapshot or attachment could not be encoded or decoded.
    #[error("Snapshot codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// A connection refused its session attachment.
    #[error("Attachment write for {connection} failed: {source}")]
    Attachment {
        connection: ConnectionId,
        #[source]
        source: TransportError,
    },

    /// Backend is not accepting writes.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Relay errors surfaced by the coordinator and partitions.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid payload or missing field.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// A client-plane message arrived for a connection with no session.
    #[error("No session for connection {0}")]
    UntrackedSession(ConnectionId),

    /// Sending to one subscriber failed.
    #[error("Delivery to {connection} failed: {source}")]
    Delivery {
        connection: ConnectionId,
        #[source]
        source: TransportError,
    },

    /// A durable write or read failed.
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    /// The target actor's mailbox is closed.
    #[error("{0} is unavailable")]
    ActorUnavailable(String),
}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        RelayError::MalformedRequest(e.to_string())
    }
}

impl RelayError {
    /// Static label suitable for metrics.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "malformed_request",
            Self::UntrackedSession(_) => "untracked_session",
            Self::Delivery { .. } => "delivery",
            Self::Storage(_) => "storage",
            Self::ActorUnavailable(_) => "actor_unavailable",
        }
    }
}
