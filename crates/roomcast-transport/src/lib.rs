//! # roomcast-transport
//!
//! Connection abstraction for the Roomcast relay.
//!
//! Partitions never touch sockets directly. They hold `Arc<dyn Connection>`
//! handles provided by the host:
//!
//! - **WebSocket** - an upgraded axum socket, split into a shared sending
//!   handle and a reader driven by the host
//! - **Local** - an in-process channel for embedding, benchmarks and tests
//!
//! ```rust,ignore
//! use roomcast_transport::{websocket, Connection};
//!
//! let (connection, mut reader) = websocket::split(socket, None, max_size);
//! while let Ok(Some(text)) = reader.recv().await {
//!     // Forward the event to the partition hosting `connection`
//! }
//! ```

pub mod local;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use local::{LocalConnection, LocalReceiver};
pub use traits::{close_code, Connection, ConnectionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketReader};
