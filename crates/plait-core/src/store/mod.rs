//! Per-topic event storage.
//!
//! A [`Store`] holds one topic's events, its heads (events not yet linked
//! by a later event) and a `(timestamp, cid)` index for range queries. A
//! [`NodeStore`] hands out one store per topic name.
//!
//! Two engines implement the contract: [`memory::MemoryStore`] and
//! [`sqlite::SqliteStore`]. Both satisfy the same behavior:
//!
//! - `insert_event` and `insert_head` are idempotent and report whether
//!   the event was newly stored.
//! - `insert_head` marks the event as a head only when it is new and no
//!   stored event links to it yet.
//! - `append_event` links the new event to every current head and makes it
//!   the sole head, atomically with respect to other calls on the store.
//! - `remove_head` reports whether the id is known locally, so the replica
//!   can decide to fetch it.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ErrorCode;
use crate::event::{Cid, Envelope, Event, EventError};
use crate::query::{QueryError, QueryPage, QueryRequest};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored event failed to decode: {0}")]
    Event(#[from] EventError),

    #[error("time index references missing event {0}")]
    CorruptIndex(Cid),

    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("storage worker failed: {0}")]
    Worker(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Sqlite(_) | Self::Io(_) | Self::Unavailable(_) => ErrorCode::StoreBackendFailure,
            Self::Event(err) => err.code(),
            Self::CorruptIndex(_) => ErrorCode::CorruptIndex,
            Self::SchemaTooNew { .. } => ErrorCode::StoreSchemaMismatch,
            Self::Worker(_) => ErrorCode::StoreWorkerFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Storage for a single topic.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a local event linking every current head and make it the only
    /// head. Heads are linked in ascending cid order.
    async fn append_event(&self, envelope: Envelope) -> Result<Arc<Event>, StoreError>;

    /// Store an event without touching heads. Returns `true` if it was new.
    async fn insert_event(&self, event: Arc<Event>) -> Result<bool, StoreError>;

    /// Store an event and, if it was new and unreferenced, mark it as a
    /// head. Returns `true` if it was new.
    async fn insert_head(&self, event: Arc<Event>) -> Result<bool, StoreError>;

    /// Unmark `cid` as a head. Returns `true` iff the event is stored.
    async fn remove_head(&self, cid: Cid) -> Result<bool, StoreError>;

    /// Ids referenced as links by stored events but not stored themselves.
    async fn find_missing_links(&self) -> Result<Vec<Cid>, StoreError>;

    /// All stored events in `(timestamp, cid)` order.
    async fn events(&self) -> Result<Vec<Arc<Event>>, StoreError>;

    /// Current head ids in ascending order.
    async fn heads(&self) -> Result<Vec<Cid>, StoreError>;

    /// Stored events among `cids`, in request order; unknown ids are
    /// skipped.
    async fn get_events(&self, cids: &[Cid]) -> Result<Vec<Arc<Event>>, StoreError>;

    async fn get(&self, cid: Cid) -> Result<Option<Arc<Event>>, StoreError> {
        Ok(self.get_events(&[cid]).await?.pop())
    }

    async fn count(&self) -> Result<usize, StoreError>;

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, QueryError>;
}

/// Factory of per-topic stores sharing one backend.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Store for `topic`. Repeated calls address the same data.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend cannot provide the topic.
    fn topic(&self, topic: &str) -> Result<Arc<dyn Store>, StoreError>;

    /// Topics that already hold events, in ascending order.
    async fn topics(&self) -> Result<Vec<String>, StoreError>;
}
