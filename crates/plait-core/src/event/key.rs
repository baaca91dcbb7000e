//! Time index keys.

use serde::{Deserialize, Serialize};

use super::EventError;
use super::cid::{CID_LEN, Cid};

/// Encoded length of a [`TimeKey`]: 8-byte timestamp followed by the cid.
pub const TIME_KEY_LEN: usize = 8 + CID_LEN;

/// Position of an event in the time index: `(timestamp_ns, cid)`.
///
/// The derived ordering compares the timestamp first and breaks ties by cid,
/// and [`TimeKey::to_bytes`] is order-preserving (big-endian timestamp), so
/// byte-ordered backends such as SQLite BLOB columns sort identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeKey {
    pub timestamp_ns: u64,
    pub cid: Cid,
}

impl TimeKey {
    pub const MIN: Self = Self::new(0, Cid::MIN);
    pub const MAX: Self = Self::new(u64::MAX, Cid::MAX);

    #[must_use]
    pub const fn new(timestamp_ns: u64, cid: Cid) -> Self {
        Self { timestamp_ns, cid }
    }

    /// Smallest key carrying `timestamp_ns`.
    #[must_use]
    pub const fn floor(timestamp_ns: u64) -> Self {
        Self::new(timestamp_ns, Cid::MIN)
    }

    /// Largest key carrying `timestamp_ns`.
    #[must_use]
    pub const fn ceiling(timestamp_ns: u64) -> Self {
        Self::new(timestamp_ns, Cid::MAX)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; TIME_KEY_LEN] {
        let mut out = [0u8; TIME_KEY_LEN];
        out[..8].copy_from_slice(&self.timestamp_ns.to_be_bytes());
        out[8..].copy_from_slice(self.cid.as_bytes());
        out
    }

    /// # Errors
    ///
    /// Returns [`EventError::InvalidTimeKey`] when `bytes` is not exactly
    /// [`TIME_KEY_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        if bytes.len() != TIME_KEY_LEN {
            return Err(EventError::InvalidTimeKey(bytes.len()));
        }
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[..8]);
        Ok(Self::new(
            u64::from_be_bytes(timestamp),
            Cid::from_slice(&bytes[8..])?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(seed: &[u8]) -> Cid {
        Cid::from(blake3::hash(seed))
    }

    #[test]
    fn byte_order_matches_key_order() {
        let mut keys = vec![
            TimeKey::new(300, cid(b"a")),
            TimeKey::new(2, cid(b"b")),
            TimeKey::new(2, cid(b"c")),
            TimeKey::new(1 << 40, cid(b"d")),
            TimeKey::new(0, cid(b"e")),
        ];
        let mut by_bytes = keys.clone();
        keys.sort();
        by_bytes.sort_by_key(TimeKey::to_bytes);
        assert_eq!(keys, by_bytes);
    }

    #[test]
    fn bytes_decode_back() {
        let key = TimeKey::new(42, cid(b"key"));
        assert_eq!(TimeKey::from_bytes(&key.to_bytes()).expect("decode"), key);
        assert!(matches!(
            TimeKey::from_bytes(&[0; 12]),
            Err(EventError::InvalidTimeKey(12))
        ));
    }

    #[test]
    fn floor_and_ceiling_bracket_a_timestamp() {
        let key = TimeKey::new(7, cid(b"x"));
        assert!(TimeKey::floor(7) <= key && key <= TimeKey::ceiling(7));
        assert!(TimeKey::ceiling(6) < key);
        assert!(TimeKey::floor(8) > key);
    }
}
