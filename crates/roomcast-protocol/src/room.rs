//! Room naming.
//!
//! A room is addressed by a caller-supplied `cluster` and `room` pair. The
//! two are joined into a single name so tenants never share a namespace.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::ProtocolError;

/// Maximum derived room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Separator placed between the cluster and room identifiers.
pub const ROOM_SEPARATOR: char = '-';

/// Validate a derived room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Room name contains control characters");
    }
    Ok(())
}

/// A fully derived room name (`cluster-room`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    /// Derive the room name for a cluster and room pair.
    ///
    /// # Errors
    ///
    /// Returns an error if either part is empty or the joined name is invalid.
    pub fn derive(cluster: &str, room: &str) -> Result<Self, ProtocolError> {
        if cluster.is_empty() {
            return Err(ProtocolError::InvalidRoom("Cluster cannot be empty"));
        }
        if room.is_empty() {
            return Err(ProtocolError::InvalidRoom("Room cannot be empty"));
        }
        Self::new(format!("{cluster}{ROOM_SEPARATOR}{room}"))
    }

    /// Wrap an already-derived room name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name fails validation.
    pub fn new(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        validate_room_name(&name).map_err(ProtocolError::InvalidRoom)?;
        Ok(Self(name))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomName {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomName> for String {
    fn from(room: RoomName) -> String {
        room.0
    }
}
