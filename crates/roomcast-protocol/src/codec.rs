//! Codec for Roomcast snapshots and client events.
//!
//! Durable actor state (coordinator tables, session attachments) is stored as
//! MessagePack behind a two byte format-version header. Client events arrive
//! as JSON text.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::events::ClientEvent;
use crate::version::{Version, FORMAT_VERSION};

/// Maximum snapshot size (16 MiB).
pub const MAX_SNAPSHOT_SIZE: usize = 16 * 1024 * 1024;

/// Version header size in bytes.
pub const HEADER_SIZE: usize = 2;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Snapshot exceeds maximum size.
    #[error("Snapshot size {0} exceeds maximum {MAX_SNAPSHOT_SIZE}")]
    SnapshotTooLarge(usize),

    /// Not enough data to decode.
    #[error("Incomplete snapshot: need {0} more bytes")]
    Incomplete(usize),

    /// Snapshot was written by an incompatible format version.
    #[error("Incompatible snapshot version {0} (current {FORMAT_VERSION})")]
    IncompatibleVersion(Version),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Client event could not be parsed.
    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] serde_json::Error),

    /// Room name failed validation.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),
}

/// Encode a value as a versioned snapshot.
///
/// The encoded format is:
/// - 1 byte: format major version
/// - 1 byte: format minor version
/// - N bytes: MessagePack-encoded value
///
/// # Errors
///
/// Returns an error if the snapshot is too large or encoding fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_SNAPSHOT_SIZE {
        return Err(ProtocolError::SnapshotTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(FORMAT_VERSION.major);
    buf.put_u8(FORMAT_VERSION.minor);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a versioned snapshot.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, written by an
/// incompatible version, or not valid MessagePack for `T`.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::Incomplete(HEADER_SIZE - data.len()));
    }

    let version = Version::new(data[0], data[1]);
    if !FORMAT_VERSION.is_compatible_with(&version) {
        return Err(ProtocolError::IncompatibleVersion(version));
    }

    let body = &data[HEADER_SIZE..];
    if body.len() > MAX_SNAPSHOT_SIZE {
        return Err(ProtocolError::SnapshotTooLarge(body.len()));
    }

    Ok(rmp_serde::from_slice(body)?)
}

/// Decode a client-plane event from a text message.
///
/// Unknown `event` tags and missing fields are rejected.
///
/// # Errors
///
/// Returns an error if the text is not a recognised event.
pub fn decode_event(text: &str) -> Result<ClientEvent, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomName;
    use std::collections::BTreeSet;

    #[test]
    fn test_snapshot_roundtrip() {
        let rooms: BTreeSet<RoomName> = [
            RoomName::derive("acme", "lobby").unwrap(),
            RoomName::derive("acme", "ops").unwrap(),
        ]
        .into_iter()
        .collect();

        let encoded = encode(&rooms).unwrap();
        assert_eq!(encoded[0], FORMAT_VERSION.major);

        let decoded: BTreeSet<RoomName> = decode(&encoded).unwrap();
        assert_eq!(rooms, decoded);
    }

    #[test]
    fn test_decode_incomplete() {
        match decode::<u32>(&[FORMAT_VERSION.major]) {
            Err(ProtocolError::Incomplete(1)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_other_major_version() {
        let mut encoded = encode(&42u32).unwrap().to_vec();
        encoded[0] = FORMAT_VERSION.major + 1;

        match decode::<u32>(&encoded) {
            Err(ProtocolError::IncompatibleVersion(v)) => {
                assert_eq!(v.major, FORMAT_VERSION.major + 1);
            }
            other => panic!("Expected IncompatibleVersion error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_event_subscribe() {
        let event =
            decode_event(r#"{"event":"subscribe","cluster":"test","room":"test"}"#).unwrap();
        assert_eq!(event.room().unwrap().as_str(), "test-test");
    }

    #[test]
    fn test_decode_event_unknown_fails() {
        assert!(matches!(
            decode_event(r#"{"event":"shout","cluster":"test","room":"test"}"#),
            Err(ProtocolError::InvalidEvent(_))
        ));
        assert!(decode_event(r#"{"event":"subscribe","cluster":"test"}"#).is_err());
        assert!(decode_event("not json").is_err());
    }
}
