//! Range queries with limit and cursor pagination over a topic's time index.
//!
//! A [`QueryRequest`] selects the events whose timestamp lies in
//! `[start_ns, end_ns]` (either bound may be `0`, meaning unbounded), in
//! ascending or descending `(timestamp, cid)` order. With a non-zero
//! `limit`, a full page carries a [`Cursor`] naming its last element;
//! passing that cursor back with the same range continues strictly after
//! it in the requested direction. A cursor that does not name a stored
//! event inside the range fails with [`QueryError::CursorNotFound`].
//!
//! [`scan`] implements the semantics over any ordered in-memory index; the
//! SQLite engine expresses the same semantics in SQL.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::event::{Cid, Event, TimeKey};
use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// Opaque continuation token: the `(timestamp, id)` of the last event of a
/// page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub timestamp_ns: u64,
    pub cid: Cid,
}

impl Cursor {
    #[must_use]
    pub const fn key(&self) -> TimeKey {
        TimeKey::new(self.timestamp_ns, self.cid)
    }
}

impl From<&Event> for Cursor {
    fn from(event: &Event) -> Self {
        Self {
            timestamp_ns: event.timestamp_ns(),
            cid: event.cid(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Inclusive lower timestamp bound; `0` means unbounded.
    pub start_ns: u64,
    /// Inclusive upper timestamp bound; `0` means unbounded.
    pub end_ns: u64,
    /// Maximum page size; `0` means no limit.
    pub limit: u32,
    pub direction: Direction,
    pub cursor: Option<Cursor>,
}

impl QueryRequest {
    #[must_use]
    pub const fn with_range(mut self, start_ns: u64, end_ns: u64) -> Self {
        self.start_ns = start_ns;
        self.end_ns = end_ns;
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub const fn descending(mut self) -> Self {
        self.direction = Direction::Descending;
        self
    }

    #[must_use]
    pub const fn ascending(mut self) -> Self {
        self.direction = Direction::Ascending;
        self
    }

    /// Continue from a previous page's cursor (`None` restarts).
    #[must_use]
    pub const fn with_cursor(mut self, cursor: Option<Cursor>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Inclusive key bounds of the requested range.
    #[must_use]
    pub const fn key_bounds(&self) -> (TimeKey, TimeKey) {
        let lower = if self.start_ns == 0 {
            TimeKey::MIN
        } else {
            TimeKey::floor(self.start_ns)
        };
        let upper = if self.end_ns == 0 {
            TimeKey::MAX
        } else {
            TimeKey::ceiling(self.end_ns)
        };
        (lower, upper)
    }

    #[must_use]
    pub fn contains(&self, key: &TimeKey) -> bool {
        let (lower, upper) = self.key_bounds();
        lower <= *key && *key <= upper
    }

    /// Page size, if limited.
    #[must_use]
    pub fn page_size(&self) -> Option<usize> {
        (self.limit > 0).then(|| usize::try_from(self.limit).unwrap_or(usize::MAX))
    }

    /// Cursor for a page produced by this request: present only when the
    /// request is limited and the page is full.
    #[must_use]
    pub fn next_cursor(&self, events: &[Arc<Event>]) -> Option<Cursor> {
        let size = self.page_size()?;
        if events.len() == size {
            events.last().map(|event| Cursor::from(event.as_ref()))
        } else {
            None
        }
    }

    fn cursor_not_found(&self) -> Option<QueryError> {
        self.cursor.map(|cursor| QueryError::CursorNotFound {
            timestamp_ns: cursor.timestamp_ns,
            cid: cursor.cid,
        })
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPage {
    pub events: Vec<Arc<Event>>,
    pub cursor: Option<Cursor>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("cursor ({timestamp_ns}, {cid}) not found in the queried range")]
    CursorNotFound { timestamp_ns: u64, cid: Cid },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::CursorNotFound { .. } => ErrorCode::CursorNotFound,
            Self::Store(err) => err.code(),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory evaluation
// ---------------------------------------------------------------------------

/// Evaluate `request` against an ordered time index.
///
/// # Errors
///
/// Returns [`QueryError::CursorNotFound`] when the request carries a cursor
/// that is outside the range or not present in `index`.
pub fn scan(
    index: &BTreeMap<TimeKey, Arc<Event>>,
    request: &QueryRequest,
) -> Result<QueryPage, QueryError> {
    let (lower, upper) = request.key_bounds();
    if lower > upper {
        return match request.cursor_not_found() {
            Some(err) => Err(err),
            None => Ok(QueryPage::default()),
        };
    }

    let mut bounds = (Bound::Included(lower), Bound::Included(upper));
    if let Some(cursor) = request.cursor {
        let key = cursor.key();
        if !request.contains(&key) || !index.contains_key(&key) {
            return Err(QueryError::CursorNotFound {
                timestamp_ns: cursor.timestamp_ns,
                cid: cursor.cid,
            });
        }
        match request.direction {
            Direction::Ascending => bounds.0 = Bound::Excluded(key),
            Direction::Descending => bounds.1 = Bound::Excluded(key),
        }
    }

    let take = request.page_size().unwrap_or(usize::MAX);
    let range = index.range(bounds).map(|(_, event)| Arc::clone(event));
    let events: Vec<Arc<Event>> = match request.direction {
        Direction::Ascending => range.take(take).collect(),
        Direction::Descending => range.rev().take(take).collect(),
    };

    let cursor = request.next_cursor(&events);
    Ok(QueryPage { events, cursor })
}
