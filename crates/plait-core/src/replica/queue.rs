//! Bounded work queues between replica loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::event::{Cid, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Events delivered by broadcast, waiting to become heads.
    Receive,
    /// Events fetched by id, waiting to be stored.
    Sync,
    /// Ids referenced as links, waiting to be resolved.
    Links,
}

impl QueueKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Receive => "receive",
            Self::Sync => "sync",
            Self::Links => "links",
        }
    }
}

/// Anything a queue carries can be named by cid in logs.
pub(crate) trait Tracked {
    fn cid(&self) -> Cid;
}

impl Tracked for Arc<Event> {
    fn cid(&self) -> Cid {
        Event::cid(self)
    }
}

impl Tracked for Cid {
    fn cid(&self) -> Cid {
        *self
    }
}

/// A queued item and the number of failed processing attempts so far.
#[derive(Debug)]
pub(crate) struct Pending<T> {
    pub(crate) item: T,
    pub(crate) attempts: u32,
}

impl<T> Pending<T> {
    pub(crate) const fn new(item: T) -> Self {
        Self { item, attempts: 0 }
    }

    pub(crate) fn retried(self) -> Self {
        Self {
            attempts: self.attempts.saturating_add(1),
            ..self
        }
    }
}

pub(crate) enum Offer<T> {
    Accepted,
    Full(Pending<T>),
    Closed,
}

/// Sending half of a bounded queue, tagged with its kind.
pub(crate) struct WorkQueue<T> {
    kind: QueueKind,
    tx: mpsc::Sender<Pending<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send> WorkQueue<T> {
    pub(crate) fn channel(kind: QueueKind, capacity: usize) -> (Self, mpsc::Receiver<Pending<T>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { kind, tx }, rx)
    }

    pub(crate) const fn kind(&self) -> QueueKind {
        self.kind
    }

    /// `(used, capacity)` slots right now.
    pub(crate) fn usage(&self) -> (usize, usize) {
        let capacity = self.tx.max_capacity();
        (capacity.saturating_sub(self.tx.capacity()), capacity)
    }

    /// Wait for room. Returns `false` if cancelled or the receiver is gone.
    pub(crate) async fn push(&self, pending: Pending<T>, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            sent = self.tx.send(pending) => sent.is_ok(),
        }
    }

    pub(crate) fn try_push(&self, pending: Pending<T>) -> Offer<T> {
        match self.tx.try_send(pending) {
            Ok(()) => Offer::Accepted,
            Err(TrySendError::Full(pending)) => Offer::Full(pending),
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Try up to `attempts` times, pausing briefly between tries, without
    /// ever waiting on the consumer.
    pub(crate) async fn offer(&self, pending: Pending<T>, attempts: u32) -> Offer<T> {
        let mut pending = pending;
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.try_push(pending) {
                Offer::Full(back) if attempt < attempts => {
                    pending = back;
                    tokio::time::sleep(Duration::from_millis(u64::from(attempt))).await;
                }
                outcome => return outcome,
            }
        }
        Offer::Full(pending)
    }
}
