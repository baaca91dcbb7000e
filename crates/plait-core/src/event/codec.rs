//! Wire encoding for events exchanged between peers and kept by stores.
//!
//! ```text
//! uvarint(32 * (1 + links)) | cid | link_0 | link_1 | ...
//! uvarint(timestamp_ns) | uvarint(topic len) | topic | message (rest)
//! ```
//!
//! The id travels with the event; decoding does not recompute it. Call
//! [`Event::verify`] on bytes received from untrusted peers.

use super::cid::{CID_LEN, Cid};
use super::{Envelope, Event, EventError};

// ---------------------------------------------------------------------------
// Varint helpers
// ---------------------------------------------------------------------------

/// Encode an unsigned 64-bit value as LEB128.
pub(crate) fn encode_varint(value: u64, buf: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Decode a LEB128 unsigned varint, returning the value and bytes consumed.
///
/// # Errors
///
/// [`EventError::Truncated`] when the input ends mid-varint and
/// [`EventError::VarintOverflow`] when it does not fit in 64 bits.
pub(crate) fn decode_varint(data: &[u8], what: &'static str) -> Result<(u64, usize), EventError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(EventError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(EventError::Truncated(what))
}

fn take<'a>(data: &'a [u8], len: u64, what: &'static str) -> Result<(&'a [u8], &'a [u8]), EventError> {
    let len = usize::try_from(len).map_err(|_| EventError::Truncated(what))?;
    if data.len() < len {
        return Err(EventError::Truncated(what));
    }
    Ok(data.split_at(len))
}

// ---------------------------------------------------------------------------
// Event codec
// ---------------------------------------------------------------------------

impl Event {
    /// Serialize the event for the wire or for storage.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let ids = (1 + self.links().len()) * CID_LEN;
        let envelope = self.envelope();
        let mut out = Vec::with_capacity(ids + envelope.topic.len() + envelope.message.len() + 24);

        encode_varint(ids as u64, &mut out);
        out.extend_from_slice(self.cid().as_bytes());
        for link in self.links() {
            out.extend_from_slice(link.as_bytes());
        }

        encode_varint(envelope.timestamp_ns, &mut out);
        encode_varint(envelope.topic.len() as u64, &mut out);
        out.extend_from_slice(envelope.topic.as_bytes());
        out.extend_from_slice(&envelope.message);
        out
    }

    /// Decode bytes produced by [`Event::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns an [`EventError`] for truncated input, an id block that is not
    /// a whole number of cids, or a topic that is not UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        let (ids_len, used) = decode_varint(bytes, "id block length")?;
        let (ids, rest) = take(&bytes[used..], ids_len, "id block")?;
        if ids.is_empty() || ids.len() % CID_LEN != 0 {
            return Err(EventError::MisalignedLinks(ids.len()));
        }
        let mut cids = ids.chunks_exact(CID_LEN).map(Cid::from_slice);
        let cid = cids.next().ok_or(EventError::Truncated("cid"))??;
        let links = cids.collect::<Result<Vec<_>, _>>()?;

        let (timestamp_ns, used) = decode_varint(rest, "timestamp")?;
        let rest = &rest[used..];
        let (topic_len, used) = decode_varint(rest, "topic length")?;
        let (topic, message) = take(&rest[used..], topic_len, "topic")?;
        let topic = std::str::from_utf8(topic).map_err(|_| EventError::TopicNotUtf8)?;

        Ok(Self::from_parts(
            Envelope::new(topic, timestamp_ns, message),
            links,
            cid,
        ))
    }
}
