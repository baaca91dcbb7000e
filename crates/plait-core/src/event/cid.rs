//! Content identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::EventError;

/// Length in bytes of a [`Cid`] (a full BLAKE3 digest).
pub const CID_LEN: usize = 32;

/// Content identifier: the BLAKE3 digest of an event's canonical bytes.
///
/// Ordering is bytewise, which is also the tie-break order of the time
/// index. Rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; CID_LEN]);

impl Cid {
    /// Lowest identifier in byte order.
    pub const MIN: Self = Self([0x00; CID_LEN]);
    /// Highest identifier in byte order.
    pub const MAX: Self = Self([0xFF; CID_LEN]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; CID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a cid from a slice that must be exactly [`CID_LEN`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidCidLength`] for any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EventError> {
        let array: [u8; CID_LEN] = bytes
            .try_into()
            .map_err(|_| EventError::InvalidCidLength(bytes.len()))?;
        Ok(Self(array))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CID_LEN] {
        &self.0
    }

    /// First four bytes as hex, for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<blake3::Hash> for Cid {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl AsRef<[u8]> for Cid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.short())
    }
}

impl FromStr for Cid {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|err| EventError::InvalidCidHex(err.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
