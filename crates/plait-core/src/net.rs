//! Transport contracts consumed by the replica.
//!
//! A [`Broadcaster`] fans locally created events out to peers and yields
//! events peers broadcast. A [`Syncer`] fetches specific events by id when
//! the replica discovers a missing link. Both are bound to a single topic;
//! [`NodeBroadcaster`] and [`NodeSyncer`] hand them out per topic name.
//!
//! Delivery is best-effort. Events may arrive late, twice or never; the
//! replica repairs gaps by fetching links.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorCode;
use crate::event::{Cid, Event, EventError};

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("transport closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("no reachable peer for topic {0}")]
    NoPeers(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("peer sent an undecodable event: {0}")]
    Codec(#[from] EventError),
}

impl NetError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Closed => ErrorCode::TransportClosed,
            Self::Cancelled => ErrorCode::TransportCancelled,
            Self::NoPeers(_) => ErrorCode::NoReachablePeer,
            Self::Transport(_) => ErrorCode::TransportFailure,
            Self::Codec(err) => err.code(),
        }
    }

    /// Whether a long-running consumer should stop instead of retrying.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}

/// Topic-scoped fan-out.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Deliver `event` to peers, best-effort.
    async fn broadcast(&self, event: Arc<Event>) -> Result<(), NetError>;

    /// Wait for the next event broadcast by a peer.
    ///
    /// Returns [`NetError::Cancelled`] once `cancel` fires.
    async fn next(&self, cancel: &CancellationToken) -> Result<Arc<Event>, NetError>;
}

/// Topic-scoped fetch by id.
#[async_trait]
pub trait Syncer: Send + Sync {
    /// Fetch `cids` from peers. The result has one slot per requested id, in
    /// request order; `None` marks an id no peer could provide.
    async fn fetch(&self, cids: &[Cid]) -> Result<Vec<Option<Arc<Event>>>, NetError>;
}

pub trait NodeBroadcaster: Send + Sync {
    fn topic(&self, topic: &str) -> Arc<dyn Broadcaster>;
}

pub trait NodeSyncer: Send + Sync {
    fn topic(&self, topic: &str) -> Arc<dyn Syncer>;
}
