//! # roomcast-protocol
//!
//! Protocol definitions shared by the Roomcast coordinator, partitions and
//! ingress.
//!
//! This crate defines the messages exchanged on both planes of the relay:
//!
//! - **Control plane** - `assign` / `report` / `publish` between the
//!   coordinator and its partitions
//! - **Client plane** - events sent by subscribers over their socket
//! - **Snapshots** - the versioned binary format used for durable actor state
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{codec, RoomName};
//!
//! let event = codec::decode_event(r#"{"event":"subscribe","cluster":"acme","room":"lobby"}"#).unwrap();
//! assert_eq!(event.room().unwrap(), RoomName::derive("acme", "lobby").unwrap());
//! ```

pub mod codec;
pub mod control;
pub mod events;
pub mod room;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use control::{FanoutSummary, LoadReport, PartitionId, PublishRequest};
pub use events::{ClientEvent, IngressPublish, SessionError};
pub use room::{RoomName, ROOM_SEPARATOR};
pub use version::{Version, FORMAT_VERSION};
