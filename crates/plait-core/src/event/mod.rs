//! Immutable, content-addressed events.
//!
//! An [`Event`] wraps a producer [`Envelope`] (timestamp, topic, message)
//! together with the ids of the events it causally follows. Its [`Cid`] is
//! the BLAKE3 digest of a canonical byte stream, streamed chunk by chunk
//! through [`ChunkReader`] so the message body is never copied:
//!
//! ```text
//! timestamp_ns (u64 BE) | topic len (u64 BE) | topic
//! message len (u64 BE) | message
//! link_0 | link_1 | ... (32 bytes each)
//! ```
//!
//! Lengths are framed so that moving bytes between topic and message yields
//! a different id. Link order is part of the digest.

pub mod cid;
pub mod codec;
pub mod key;

use std::io::{self, Read};

use serde::{Deserialize, Serialize};

pub use cid::{CID_LEN, Cid};
pub use key::{TIME_KEY_LEN, TimeKey};

use crate::error::ErrorCode;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from building, decoding or identifying events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("failed to digest event: {0}")]
    Digest(#[from] io::Error),

    #[error("cid must be {CID_LEN} bytes, got {0}")]
    InvalidCidLength(usize),

    #[error("cid is not valid hex: {0}")]
    InvalidCidHex(String),

    #[error("time key must be {TIME_KEY_LEN} bytes, got {0}")]
    InvalidTimeKey(usize),

    #[error("truncated event bytes while reading {0}")]
    Truncated(&'static str),

    #[error("varint overflow: more than 10 bytes")]
    VarintOverflow,

    #[error("id and links block of {0} bytes is not a multiple of {CID_LEN}")]
    MisalignedLinks(usize),

    #[error("topic is not valid UTF-8")]
    TopicNotUtf8,
}

impl EventError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Digest(_) => ErrorCode::EventDigestFailed,
            Self::InvalidCidLength(_) | Self::InvalidCidHex(_) | Self::InvalidTimeKey(_) => {
                ErrorCode::InvalidCid
            }
            Self::Truncated(_)
            | Self::VarintOverflow
            | Self::MisalignedLinks(_)
            | Self::TopicNotUtf8 => ErrorCode::EventDecodeFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Producer-supplied payload of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Producer wall clock in nanoseconds. Used for ordering only.
    pub timestamp_ns: u64,
    pub topic: String,
    pub message: Vec<u8>,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, timestamp_ns: u64, message: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp_ns,
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Envelope stamped with the current wall clock.
    pub fn now(topic: impl Into<String>, message: impl Into<Vec<u8>>) -> Self {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self::new(topic, u64::try_from(nanos).unwrap_or_default(), message)
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An immutable node of a topic's Merkle-clock DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    envelope: Envelope,
    links: Vec<Cid>,
    cid: Cid,
}

impl Event {
    /// Build an event and compute its id.
    ///
    /// The id is a pure function of the envelope and the ordered links, so
    /// two nodes building the same event independently agree on it.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Digest`] if streaming the canonical bytes into
    /// the hasher fails.
    pub fn new(envelope: Envelope, links: Vec<Cid>) -> Result<Self, EventError> {
        let cid = digest(&envelope, &links)?;
        Ok(Self {
            envelope,
            links,
            cid,
        })
    }

    /// Reassemble an event whose id was carried alongside it (wire decoding,
    /// storage reads). The id is not recomputed; see [`Event::verify`].
    pub(crate) const fn from_parts(envelope: Envelope, links: Vec<Cid>, cid: Cid) -> Self {
        Self {
            envelope,
            links,
            cid,
        }
    }

    #[must_use]
    pub const fn cid(&self) -> Cid {
        self.cid
    }

    #[must_use]
    pub fn links(&self) -> &[Cid] {
        &self.links
    }

    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    #[must_use]
    pub const fn timestamp_ns(&self) -> u64 {
        self.envelope.timestamp_ns
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.envelope.topic
    }

    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.envelope.message
    }

    /// Position of this event in the time index.
    #[must_use]
    pub const fn time_key(&self) -> TimeKey {
        TimeKey::new(self.envelope.timestamp_ns, self.cid)
    }

    /// Fresh reader over the canonical bytes. Each call starts at the
    /// beginning, so the same event can be digested any number of times.
    #[must_use]
    pub fn reader(&self) -> ChunkReader<'_> {
        ChunkReader::new(&self.envelope, &self.links)
    }

    /// Recompute the digest and compare it with the carried id.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Digest`] if the digest cannot be computed.
    pub fn verify(&self) -> Result<bool, EventError> {
        Ok(digest(&self.envelope, &self.links)? == self.cid)
    }
}

fn digest(envelope: &Envelope, links: &[Cid]) -> Result<Cid, EventError> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(ChunkReader::new(envelope, links))?;
    Ok(Cid::from(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Chunk reader
// ---------------------------------------------------------------------------

enum Chunk<'a> {
    Inline { bytes: [u8; 16], len: usize },
    Borrowed(&'a [u8]),
}

impl Chunk<'_> {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Inline { bytes, len } => &bytes[..*len],
            Self::Borrowed(slice) => slice,
        }
    }
}

/// Sequential reader over an event's canonical bytes.
///
/// Borrows the topic, message and links in place; only the fixed-width
/// framing lives inside the reader.
pub struct ChunkReader<'a> {
    chunks: Vec<Chunk<'a>>,
    index: usize,
    offset: usize,
}

impl<'a> ChunkReader<'a> {
    fn new(envelope: &'a Envelope, links: &'a [Cid]) -> Self {
        let mut header = [0u8; 16];
        header[..8].copy_from_slice(&envelope.timestamp_ns.to_be_bytes());
        header[8..].copy_from_slice(&(envelope.topic.len() as u64).to_be_bytes());

        let mut message_len = [0u8; 16];
        message_len[..8].copy_from_slice(&(envelope.message.len() as u64).to_be_bytes());

        let mut chunks = Vec::with_capacity(4 + links.len());
        chunks.push(Chunk::Inline {
            bytes: header,
            len: 16,
        });
        chunks.push(Chunk::Borrowed(envelope.topic.as_bytes()));
        chunks.push(Chunk::Inline {
            bytes: message_len,
            len: 8,
        });
        chunks.push(Chunk::Borrowed(&envelope.message));
        chunks.extend(links.iter().map(|link| Chunk::Borrowed(link.as_bytes())));

        Self {
            chunks,
            index: 0,
            offset: 0,
        }
    }
}

impl Read for ChunkReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let Some(chunk) = self.chunks.get(self.index) else {
                break;
            };
            let chunk = chunk.as_slice();
            let remaining = &chunk[self.offset..];
            let n = remaining.len().min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&remaining[..n]);
            written += n;
            self.offset += n;
            if self.offset == chunk.len() {
                self.index += 1;
                self.offset = 0;
            }
        }
        Ok(written)
    }
}
