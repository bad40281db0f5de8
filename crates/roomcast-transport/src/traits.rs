//! Connection abstraction for Roomcast.
//!
//! A connection is owned by the host (the ingress server), not by the
//! partition serving it. Partitions hold shared handles and may be stopped
//! and re-activated while the underlying socket stays open; the small
//! attachment stored on each connection is what lets a re-activated partition
//! rebuild its session.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// WebSocket close codes used by the relay.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The client sent an event the relay does not understand.
    pub const UNSUPPORTED: u16 = 1003;
    /// The client sent a message over the size limit.
    pub const TOO_LARGE: u16 = 1009;
    /// The server could not serve the session.
    pub const INTERNAL: u16 = 1011;
}

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound message exceeds the configured limit.
    #[error("Message of {0} bytes exceeds the size limit")]
    MessageTooLarge(usize),

    /// The attachment could not be stored.
    #[error("Attachment rejected: {0}")]
    Attachment(String),
}

/// An open, host-managed channel to a single client.
///
/// Methods take `&self` so the same connection can be shared between the
/// host's read loop and the partition that fans messages out to it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Send a payload to the client verbatim.
    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Close the connection with a close code and reason.
    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError>;

    /// The attachment last stored on this connection, if any.
    fn attachment(&self) -> Option<Bytes>;

    /// Replace the attachment stored on this connection.
    async fn set_attachment(&self, attachment: Bytes) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
