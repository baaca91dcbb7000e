//! Topic replica: the convergence protocol.
//!
//! A replica owns three bounded queues and five loops:
//!
//! ```text
//! broadcaster.next ──> [receive] ──> insert_head ──> [links] ──> remove_head
//!                                                       ^            │ unknown
//!                                                       │            v
//!                                 insert_event <── [sync] <──── syncer.fetch
//!                                       │
//!                                       └──── links of new events ──> [links]
//!
//! repair: find_missing_links ──> [links]   (on dead-letter, abandon, timer)
//! ```
//!
//! Pushes that cannot form a cycle (broadcast → receive, receive → links,
//! repair → receive and links) wait for room. Pushes between the link and
//! sync loops and every retry use a bounded number of non-blocking
//! attempts; an item that still does not fit is dead-lettered and the
//! repair loop later re-derives the outstanding links from the store.
//! Failed items are retried after an exponential backoff on a detached
//! timer until their retry budget runs out, then abandoned the same way.
//! Abandoned broadcast events are not in the store yet, so they are parked
//! and the next sweep queues them again.

pub mod metrics;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

pub use metrics::{MetricsSnapshot, ReplicaMetrics};
pub use queue::QueueKind;

use self::metrics::Counter;
use self::queue::{Offer, Pending, Tracked, WorkQueue};
use crate::config::ReplicaConfig;
use crate::error::ErrorCode;
use crate::event::{Cid, Envelope, Event};
use crate::net::{Broadcaster, NetError, Syncer};
use crate::query::{QueryError, QueryPage, QueryRequest};
use crate::store::{Store, StoreError};

/// Called for every event delivered by the broadcaster, after it has been
/// queued for storage.
pub type Observer = Arc<dyn Fn(&Arc<Event>) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("replica for topic {0} is closed")]
    Closed(String),
}

impl ReplicaError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Store(err) => err.code(),
            Self::Query(err) => err.code(),
            Self::Net(err) => err.code(),
            Self::Closed(_) => ErrorCode::TransportCancelled,
        }
    }
}

/// Collaborators a replica works against.
#[derive(Clone)]
pub struct ReplicaParts {
    pub store: Arc<dyn Store>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub syncer: Arc<dyn Syncer>,
    pub observer: Option<Observer>,
}

// ---------------------------------------------------------------------------
// Shared loop state
// ---------------------------------------------------------------------------

struct Shared {
    topic: Arc<str>,
    config: ReplicaConfig,
    store: Arc<dyn Store>,
    broadcaster: Arc<dyn Broadcaster>,
    syncer: Arc<dyn Syncer>,
    observer: Option<Observer>,
    metrics: ReplicaMetrics,
    cancel: CancellationToken,
    repair: Notify,
    /// Broadcast events whose retry budget ran out before they were stored.
    parked: Mutex<Vec<Arc<Event>>>,
    receive: WorkQueue<Arc<Event>>,
    sync: WorkQueue<Arc<Event>>,
    links: WorkQueue<Cid>,
}

impl Shared {
    async fn recv<T>(&self, rx: &mut mpsc::Receiver<Pending<T>>) -> Option<Pending<T>> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            next = rx.recv() => next,
        }
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn sample<T: Send>(&self, queue: &WorkQueue<T>) {
        let (used, capacity) = queue.usage();
        self.metrics
            .record_fill(&self.topic, queue.kind(), used, capacity);
    }

    /// Bounded, non-blocking enqueue; dead-letters what does not fit.
    async fn offer<T: Tracked + Send>(&self, queue: &WorkQueue<T>, pending: Pending<T>) {
        self.sample(queue);
        if let Offer::Full(pending) = queue.offer(pending, self.config.enqueue_attempts).await {
            self.metrics.bump(Counter::DeadLetters);
            warn!(
                queue = queue.kind().as_str(),
                cid = %pending.item.cid().short(),
                "queue full, dead-lettering item"
            );
            self.repair.notify_one();
        }
    }

    /// Schedule another attempt after a backoff. Once the retry budget is
    /// spent the item is handed back, abandoned.
    fn retry<T: Tracked + Send + 'static>(
        self: &Arc<Self>,
        queue: &WorkQueue<T>,
        pending: Pending<T>,
    ) -> Option<Pending<T>> {
        let pending = pending.retried();
        if pending.attempts >= self.config.max_attempts {
            self.metrics.bump(Counter::Abandoned);
            error!(
                queue = queue.kind().as_str(),
                cid = %pending.item.cid().short(),
                attempts = pending.attempts,
                "retry budget exhausted, abandoning item"
            );
            return Some(pending);
        }

        self.metrics.bump(Counter::Retries);
        let delay = self.config.backoff(pending.attempts);
        let shared = Arc::clone(self);
        let queue = queue.clone();
        tokio::spawn(
            async move {
                if shared.pause(delay).await {
                    shared.offer(&queue, pending).await;
                }
            }
            .instrument(Span::current()),
        );
        None
    }

    /// Retry a link or fetched event. Its id stays a missing link in the
    /// store, so an abandoned one is recovered by a sweep.
    fn retry_or_sweep<T: Tracked + Send + 'static>(
        self: &Arc<Self>,
        queue: &WorkQueue<T>,
        pending: Pending<T>,
    ) {
        if self.retry(queue, pending).is_some() {
            self.repair.notify_one();
        }
    }

    // -- loops ---------------------------------------------------------------

    async fn broadcast_loop(self: Arc<Self>) {
        loop {
            let event = match self.broadcaster.next(&self.cancel).await {
                Ok(event) => event,
                Err(err) if err.is_terminal() => {
                    debug!(%err, "broadcast consumer stopping");
                    return;
                }
                Err(err) => {
                    warn!(%err, "broadcast receive failed");
                    if !self.pause(self.config.backoff(1)).await {
                        return;
                    }
                    continue;
                }
            };

            debug!(cid = %event.cid().short(), "received broadcast event");
            self.metrics.bump(Counter::ReceivedBroadcast);
            self.sample(&self.receive);
            if !self
                .receive
                .push(Pending::new(Arc::clone(&event)), &self.cancel)
                .await
            {
                return;
            }
            if let Some(observer) = &self.observer {
                observer(&event);
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Pending<Arc<Event>>>) {
        while let Some(pending) = self.recv(&mut rx).await {
            match self.store.insert_head(Arc::clone(&pending.item)).await {
                Ok(true) => {
                    debug!(cid = %pending.item.cid().short(), "stored new head");
                    for link in pending.item.links() {
                        self.sample(&self.links);
                        if !self.links.push(Pending::new(*link), &self.cancel).await {
                            return;
                        }
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        %err,
                        cid = %pending.item.cid().short(),
                        attempts = pending.attempts,
                        "insert_head failed"
                    );
                    if let Some(abandoned) = self.retry(&self.receive, pending) {
                        self.parked.lock().push(abandoned.item);
                    }
                }
            }
        }
    }

    async fn link_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Pending<Cid>>) {
        while let Some(pending) = self.recv(&mut rx).await {
            let cid = pending.item;
            match self.store.remove_head(cid).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    warn!(%err, cid = %cid.short(), attempts = pending.attempts, "remove_head failed");
                    self.retry_or_sweep(&self.links, pending);
                    continue;
                }
            }

            debug!(cid = %cid.short(), "fetching missing link");
            match self.syncer.fetch(&[cid]).await {
                Ok(found) => match found.into_iter().flatten().find(|event| event.cid() == cid) {
                    Some(event) => {
                        self.metrics.bump(Counter::Fetched);
                        self.offer(&self.sync, Pending::new(event)).await;
                    }
                    None => {
                        self.metrics.bump(Counter::FetchMisses);
                        debug!(cid = %cid.short(), attempts = pending.attempts, "link not found on peers");
                        self.retry_or_sweep(&self.links, pending);
                    }
                },
                Err(err) => {
                    self.metrics.bump(Counter::FetchErrors);
                    warn!(%err, cid = %cid.short(), attempts = pending.attempts, "fetch failed");
                    self.retry_or_sweep(&self.links, pending);
                }
            }
        }
    }

    async fn sync_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Pending<Arc<Event>>>) {
        while let Some(pending) = self.recv(&mut rx).await {
            match self.store.insert_event(Arc::clone(&pending.item)).await {
                Ok(true) => {
                    self.metrics.bump(Counter::ReceivedSync);
                    debug!(cid = %pending.item.cid().short(), "stored fetched event");
                    for link in pending.item.links() {
                        self.offer(&self.links, Pending::new(*link)).await;
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        %err,
                        cid = %pending.item.cid().short(),
                        attempts = pending.attempts,
                        "insert_event failed"
                    );
                    self.retry_or_sweep(&self.sync, pending);
                }
            }
        }
    }

    async fn repair_loop(self: Arc<Self>) {
        let interval = self.config.repair_interval();
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                () = self.repair.notified() => {}
                () = tick(interval) => {}
            }
            self.sweep().await;
        }
    }

    /// Requeue parked broadcast events, then re-seed the links queue from
    /// the store. Waits for room; the loops downstream never wait on the
    /// repair loop. Returns how many items were queued.
    async fn sweep(&self) -> usize {
        self.metrics.bump(Counter::RepairSweeps);
        let parked = std::mem::take(&mut *self.parked.lock());
        let mut seeded = 0;
        for event in parked {
            debug!(cid = %event.cid().short(), "requeueing parked broadcast event");
            if !self.receive.push(Pending::new(event), &self.cancel).await {
                return seeded;
            }
            seeded += 1;
        }

        let missing = match self.store.find_missing_links().await {
            Ok(missing) => missing,
            Err(err) => {
                warn!(%err, "repair sweep could not list missing links");
                return seeded;
            }
        };

        let total = missing.len();
        for cid in missing {
            if !self.links.push(Pending::new(cid), &self.cancel).await {
                break;
            }
            seeded += 1;
        }
        if total > 0 {
            debug!(missing = total, seeded, "repair sweep");
        }
        seeded
    }
}

fn spawn_loop<F>(topic: &str, name: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(task.instrument(info_span!("replica", topic, task = name)))
}

async fn tick(interval: Option<Duration>) {
    match interval {
        Some(period) => tokio::time::sleep(period).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Replica
// ---------------------------------------------------------------------------

/// Replicates one topic with every peer reachable through its transport.
pub struct Replica {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Replica {
    /// Spawn the replica's loops without bootstrapping.
    ///
    /// The replica stops when `parent` is cancelled, when [`Replica::close`]
    /// is called, or when it is dropped.
    #[must_use]
    pub fn new(
        topic: &str,
        config: ReplicaConfig,
        parts: ReplicaParts,
        parent: &CancellationToken,
    ) -> Self {
        let (receive, receive_rx) = WorkQueue::channel(QueueKind::Receive, config.receive_capacity);
        let (sync, sync_rx) = WorkQueue::channel(QueueKind::Sync, config.sync_capacity);
        let (links, links_rx) = WorkQueue::channel(QueueKind::Links, config.links_capacity);

        let shared = Arc::new(Shared {
            topic: Arc::from(topic),
            config,
            store: parts.store,
            broadcaster: parts.broadcaster,
            syncer: parts.syncer,
            observer: parts.observer,
            metrics: ReplicaMetrics::default(),
            cancel: parent.child_token(),
            repair: Notify::new(),
            parked: Mutex::new(Vec::new()),
            receive,
            sync,
            links,
        });

        let tasks = vec![
            spawn_loop(topic, "broadcast", Arc::clone(&shared).broadcast_loop()),
            spawn_loop(topic, "receive", Arc::clone(&shared).receive_loop(receive_rx)),
            spawn_loop(topic, "links", Arc::clone(&shared).link_loop(links_rx)),
            spawn_loop(topic, "sync", Arc::clone(&shared).sync_loop(sync_rx)),
            spawn_loop(topic, "repair", Arc::clone(&shared).repair_loop()),
        ];

        Self {
            shared,
            tasks: Mutex::new(tasks),
        }
    }

    /// Spawn the loops and bootstrap: every link the store already knows to
    /// be missing is queued for fetching before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot list missing links or the
    /// replica is cancelled while seeding; the loops are stopped first.
    pub async fn start(
        topic: &str,
        config: ReplicaConfig,
        parts: ReplicaParts,
        parent: &CancellationToken,
    ) -> Result<Self, ReplicaError> {
        let replica = Self::new(topic, config, parts, parent);
        match replica.bootstrap().await {
            Ok(_) => Ok(replica),
            Err(err) => {
                replica.close().await;
                Err(err)
            }
        }
    }

    /// Queue every missing link for fetching, waiting for room as needed.
    /// Returns how many links were queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot list missing links or the
    /// replica is closed while seeding.
    pub async fn bootstrap(&self) -> Result<usize, ReplicaError> {
        let shared = &self.shared;
        let missing = shared.store.find_missing_links().await?;
        let total = missing.len();
        for cid in missing {
            if !shared.links.push(Pending::new(cid), &shared.cancel).await {
                return Err(ReplicaError::Closed(shared.topic.to_string()));
            }
        }
        info!(topic = %shared.topic, missing = total, "bootstrap queued missing links");
        Ok(total)
    }

    /// Append a local event on top of the current heads and broadcast it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the append or the broadcaster
    /// fails; in the latter case the event is already stored and will reach
    /// peers through later links.
    pub async fn broadcast_append(&self, envelope: Envelope) -> Result<Arc<Event>, ReplicaError> {
        let event = self.shared.store.append_event(envelope).await?;
        debug!(topic = %self.shared.topic, cid = %event.cid().short(), "appended local event");
        self.shared.broadcaster.broadcast(Arc::clone(&event)).await?;
        Ok(event)
    }

    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_events(&self, cids: &[Cid]) -> Result<Vec<Arc<Event>>, ReplicaError> {
        Ok(self.shared.store.get_events(cids).await?)
    }

    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get(&self, cid: Cid) -> Result<Option<Arc<Event>>, ReplicaError> {
        Ok(self.shared.store.get(cid).await?)
    }

    /// # Errors
    ///
    /// Returns [`QueryError::CursorNotFound`] (wrapped) for a stale cursor.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryPage, ReplicaError> {
        Ok(self.shared.store.query(request).await?)
    }

    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn heads(&self) -> Result<Vec<Cid>, ReplicaError> {
        Ok(self.shared.store.heads().await?)
    }

    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn events(&self) -> Result<Vec<Arc<Event>>, ReplicaError> {
        Ok(self.shared.store.events().await?)
    }

    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn count(&self) -> Result<usize, ReplicaError> {
        Ok(self.shared.store.count().await?)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Ask the repair loop for an immediate missing-link sweep.
    pub fn request_repair(&self) {
        self.shared.repair.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Cancel the loops and wait for them to exit.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                error!(topic = %self.shared.topic, %err, "replica task ended abnormally");
            }
        }
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    use super::*;
    use crate::store::memory::MemoryStore;

    // ---------------------------------------------------------------------------
    // Test doubles
    // ---------------------------------------------------------------------------

    /// Broadcaster whose inbox is fed by the test; records what it sends.
    struct ScriptedBroadcaster {
        sent: Mutex<Vec<Arc<Event>>>,
        inbox_tx: UnboundedSender<Arc<Event>>,
        inbox_rx: tokio::sync::Mutex<UnboundedReceiver<Arc<Event>>>,
    }

    impl ScriptedBroadcaster {
        fn new() -> Arc<Self> {
            let (inbox_tx, inbox_rx) = unbounded_channel();
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                inbox_tx,
                inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            })
        }

        fn deliver(&self, event: &Arc<Event>) {
            self.inbox_tx.send(Arc::clone(event)).expect("inbox open");
        }
    }

    #[async_trait]
    impl Broadcaster for ScriptedBroadcaster {
        async fn broadcast(&self, event: Arc<Event>) -> Result<(), NetError> {
            self.sent.lock().push(event);
            Ok(())
        }

        async fn next(&self, cancel: &CancellationToken) -> Result<Arc<Event>, NetError> {
            let mut inbox = self.inbox_rx.lock().await;
            tokio::select! {
                () = cancel.cancelled() => Err(NetError::Cancelled),
                event = inbox.recv() => event.ok_or(NetError::Closed),
            }
        }
    }

    /// Fetches from a fixed set of peer stores, optionally slowly.
    struct PeerSyncer {
        peers: Vec<Arc<dyn Store>>,
        delay: Duration,
    }

    #[async_trait]
    impl Syncer for PeerSyncer {
        async fn fetch(&self, cids: &[Cid]) -> Result<Vec<Option<Arc<Event>>>, NetError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut out = Vec::with_capacity(cids.len());
            for cid in cids {
                let mut found = None;
                for peer in &self.peers {
                    if let Some(event) = peer
                        .get(*cid)
                        .await
                        .map_err(|err| NetError::Transport(err.to_string()))?
                    {
                        found = Some(event);
                        break;
                    }
                }
                out.push(found);
            }
            Ok(out)
        }
    }

    /// Memory store with injectable failures.
    struct FlakyStore {
        inner: MemoryStore,
        head_failures: AtomicU32,
        listing_fails: bool,
    }

    impl FlakyStore {
        fn new(head_failures: u32, listing_fails: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new("flaky"),
                head_failures: AtomicU32::new(head_failures),
                listing_fails,
            })
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn append_event(&self, envelope: Envelope) -> Result<Arc<Event>, StoreError> {
            self.inner.append_event(envelope).await
        }

        async fn insert_event(&self, event: Arc<Event>) -> Result<bool, StoreError> {
            self.inner.insert_event(event).await
        }

        async fn insert_head(&self, event: Arc<Event>) -> Result<bool, StoreError> {
            let left = self.head_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.head_failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("injected".into()));
            }
            self.inner.insert_head(event).await
        }

        async fn remove_head(&self, cid: Cid) -> Result<bool, StoreError> {
            self.inner.remove_head(cid).await
        }

        async fn find_missing_links(&self) -> Result<Vec<Cid>, StoreError> {
            if self.listing_fails {
                return Err(StoreError::Unavailable("injected".into()));
            }
            self.inner.find_missing_links().await
        }

        async fn events(&self) -> Result<Vec<Arc<Event>>, StoreError> {
            self.inner.events().await
        }

        async fn heads(&self) -> Result<Vec<Cid>, StoreError> {
            self.inner.heads().await
        }

        async fn get_events(&self, cids: &[Cid]) -> Result<Vec<Arc<Event>>, StoreError> {
            self.inner.get_events(cids).await
        }

        async fn count(&self) -> Result<usize, StoreError> {
            self.inner.count().await
        }

        async fn query(&self, request: &QueryRequest) -> Result<QueryPage, QueryError> {
            self.inner.query(request).await
        }
    }

    // ---------------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------------

    fn fast_config() -> ReplicaConfig {
        ReplicaConfig {
            retry_backoff_ms: 1,
            max_backoff_ms: 5,
            repair_interval_ms: 0,
            ..ReplicaConfig::default()
        }
    }

    fn parts(
        store: Arc<dyn Store>,
        broadcaster: Arc<ScriptedBroadcaster>,
        peers: Vec<Arc<dyn Store>>,
    ) -> ReplicaParts {
        ReplicaParts {
            store,
            broadcaster,
            syncer: Arc::new(PeerSyncer {
                peers,
                delay: Duration::ZERO,
            }),
            observer: None,
        }
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Peer store holding a three-event chain; returns the events oldest first.
    async fn peer_chain() -> (Arc<MemoryStore>, Vec<Arc<Event>>) {
        let peer = Arc::new(MemoryStore::new("chain"));
        let mut events = Vec::new();
        for ts in 1..=3 {
            events.push(
                peer.append_event(Envelope::new("chain", ts, format!("m{ts}")))
                    .await
                    .expect("append"),
            );
        }
        (peer, events)
    }

    // ---------------------------------------------------------------------------
    // Tests
    // ---------------------------------------------------------------------------

    #[tokio::test]
    async fn broadcast_append_stores_then_broadcasts() {
        let store = Arc::new(MemoryStore::new("t"));
        let broadcaster = ScriptedBroadcaster::new();
        let replica = Replica::new(
            "t",
            fast_config(),
            parts(store, Arc::clone(&broadcaster), vec![]),
            &CancellationToken::new(),
        );

        let first = replica
            .broadcast_append(Envelope::new("t", 1, b"one".to_vec()))
            .await
            .expect("append");
        let second = replica
            .broadcast_append(Envelope::new("t", 2, b"two".to_vec()))
            .await
            .expect("append");

        assert_eq!(second.links(), &[first.cid()]);
        assert_eq!(replica.heads().await.expect("heads"), vec![second.cid()]);
        assert_eq!(broadcaster.sent.lock().len(), 2);
        replica.close().await;
    }

    #[tokio::test]
    async fn broadcast_event_becomes_head_and_notifies_observer() {
        let store = Arc::new(MemoryStore::new("t"));
        let broadcaster = ScriptedBroadcaster::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&seen);
        let mut replica_parts = parts(store, Arc::clone(&broadcaster), vec![]);
        replica_parts.observer = Some(Arc::new(move |_event: &Arc<Event>| {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        let replica = Replica::new("t", fast_config(), replica_parts, &CancellationToken::new());

        let event = Arc::new(Event::new(Envelope::new("t", 5, b"remote".to_vec()), vec![]).expect("event"));
        broadcaster.deliver(&event);
        broadcaster.deliver(&event);

        let (replica, cid, seen) = (&replica, event.cid(), &seen);
        eventually("remote event stored", || async move {
            replica.heads().await.expect("heads") == vec![cid]
        })
        .await;
        eventually("observer calls", || async move { seen.load(Ordering::SeqCst) == 2 }).await;
        assert_eq!(replica.count().await.expect("count"), 1);
        assert_eq!(replica.metrics().received_broadcast, 2);
        replica.close().await;
    }

    #[tokio::test]
    async fn missing_links_are_fetched_from_peers() {
        let (peer, chain) = peer_chain().await;
        let broadcaster = ScriptedBroadcaster::new();
        let replica = Replica::new(
            "chain",
            fast_config(),
            parts(Arc::new(MemoryStore::new("chain")), Arc::clone(&broadcaster), vec![peer as Arc<dyn Store>]),
            &CancellationToken::new(),
        );

        broadcaster.deliver(&chain[2]);
        let replica = &replica;
        eventually("backward walk", || async move { replica.count().await.expect("count") == 3 }).await;

        assert_eq!(replica.heads().await.expect("heads"), vec![chain[2].cid()]);
        let metrics = replica.metrics();
        assert_eq!(metrics.fetched, 2);
        assert_eq!(metrics.received_sync, 2);
        replica.close().await;
    }

    #[tokio::test]
    async fn start_bootstraps_missing_links() {
        let (peer, chain) = peer_chain().await;
        let local = Arc::new(MemoryStore::new("chain"));
        local.insert_head(Arc::clone(&chain[2])).await.expect("seed");
        assert_eq!(
            local.find_missing_links().await.expect("missing"),
            vec![chain[1].cid()]
        );

        let replica = Replica::start(
            "chain",
            fast_config(),
            parts(local, ScriptedBroadcaster::new(), vec![peer as Arc<dyn Store>]),
            &CancellationToken::new(),
        )
        .await
        .expect("start");

        let replica = &replica;
        eventually("bootstrap repair", || async move { replica.count().await.expect("count") == 3 }).await;
        assert_eq!(replica.heads().await.expect("heads"), vec![chain[2].cid()]);
        replica.close().await;
    }

    #[tokio::test]
    async fn start_fails_when_store_cannot_list_missing_links() {
        let result = Replica::start(
            "t",
            fast_config(),
            parts(FlakyStore::new(0, true), ScriptedBroadcaster::new(), vec![]),
            &CancellationToken::new(),
        )
        .await;
        let err = result.err().expect("bootstrap failure");
        assert_eq!(err.code(), ErrorCode::StoreBackendFailure);
    }

    #[tokio::test]
    async fn store_failures_are_retried() {
        let store = FlakyStore::new(2, false);
        let broadcaster = ScriptedBroadcaster::new();
        let replica = Replica::new(
            "t",
            fast_config(),
            parts(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&broadcaster), vec![]),
            &CancellationToken::new(),
        );

        let event = Arc::new(Event::new(Envelope::new("t", 1, b"x".to_vec()), vec![]).expect("event"));
        broadcaster.deliver(&event);

        let replica = &replica;
        eventually("stored after retries", || async move {
            replica.count().await.expect("count") == 1
        })
        .await;
        assert_eq!(replica.metrics().retries, 2);
        assert_eq!(replica.metrics().abandoned, 0);
        replica.close().await;
    }

    #[tokio::test]
    async fn unresolvable_link_is_abandoned_and_triggers_repair() {
        let broadcaster = ScriptedBroadcaster::new();
        let config = ReplicaConfig {
            max_attempts: 3,
            ..fast_config()
        };
        let replica = Replica::new(
            "t",
            config,
            parts(Arc::new(MemoryStore::new("t")), Arc::clone(&broadcaster), vec![]),
            &CancellationToken::new(),
        );

        let orphan = Event::new(Envelope::new("t", 1, b"never seen".to_vec()), vec![]).expect("orphan");
        let child = Arc::new(
            Event::new(Envelope::new("t", 2, b"child".to_vec()), vec![orphan.cid()]).expect("child"),
        );
        broadcaster.deliver(&child);

        let replica = &replica;
        eventually("abandon and repair", || async move {
            let metrics = replica.metrics();
            metrics.abandoned >= 1 && metrics.repair_sweeps >= 1
        })
        .await;
        assert!(replica.metrics().fetch_misses >= 3);
        assert_eq!(replica.count().await.expect("count"), 1);
        replica.close().await;
    }

    #[tokio::test]
    async fn parent_cancellation_stops_replica() {
        let parent = CancellationToken::new();
        let replica = Replica::new(
            "t",
            fast_config(),
            parts(Arc::new(MemoryStore::new("t")), ScriptedBroadcaster::new(), vec![]),
            &parent,
        );
        assert!(!replica.is_closed());
        parent.cancel();
        assert!(replica.is_closed());
        replica.close().await;
        assert!(replica.tasks.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dead_lettered_links_of_a_wide_merge_are_swept_in() {
        // Thirty roots merged by one event, then a tip on top.
        let peer = Arc::new(MemoryStore::new("wide"));
        let mut roots = Vec::new();
        for ts in 1..=30 {
            let root = Arc::new(
                Event::new(Envelope::new("wide", ts, format!("root {ts}")), vec![]).expect("root"),
            );
            peer.insert_event(Arc::clone(&root)).await.expect("seed");
            roots.push(root.cid());
        }
        let merge = Arc::new(Event::new(Envelope::new("wide", 31, b"merge".to_vec()), roots).expect("merge"));
        peer.insert_event(Arc::clone(&merge)).await.expect("seed");
        let tip = Arc::new(
            Event::new(Envelope::new("wide", 32, b"tip".to_vec()), vec![merge.cid()]).expect("tip"),
        );
        peer.insert_event(Arc::clone(&tip)).await.expect("seed");

        let config = ReplicaConfig {
            receive_capacity: 1,
            sync_capacity: 1,
            links_capacity: 1,
            enqueue_attempts: 1,
            ..fast_config()
        };
        let local = Arc::new(MemoryStore::new("wide"));
        let broadcaster = ScriptedBroadcaster::new();
        let replica = Replica::new(
            "wide",
            config,
            ReplicaParts {
                store: Arc::clone(&local) as Arc<dyn Store>,
                broadcaster: Arc::clone(&broadcaster) as Arc<dyn Broadcaster>,
                syncer: Arc::new(PeerSyncer {
                    peers: vec![peer as Arc<dyn Store>],
                    delay: Duration::from_millis(15),
                }),
                observer: None,
            },
            &CancellationToken::new(),
        );
        broadcaster.deliver(&tip);

        let replica = &replica;
        eventually("wide convergence", || async move {
            replica.count().await.expect("count") == 32
        })
        .await;
        assert!(local.find_missing_links().await.expect("missing").is_empty());
        assert_eq!(replica.heads().await.expect("heads"), vec![tip.cid()]);
        let metrics = replica.metrics();
        assert!(metrics.dead_letters > 0, "{metrics:?}");
        assert!(metrics.repair_sweeps > 0, "{metrics:?}");
        assert_eq!(metrics.received_sync, 31);
        replica.close().await;
    }

    #[tokio::test]
    async fn abandoned_broadcast_event_is_parked_until_the_next_sweep() {
        let store = FlakyStore::new(3, false);
        let broadcaster = ScriptedBroadcaster::new();
        let config = ReplicaConfig {
            max_attempts: 3,
            ..fast_config()
        };
        let replica = Replica::new(
            "t",
            config,
            parts(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&broadcaster), vec![]),
            &CancellationToken::new(),
        );

        let event = Arc::new(Event::new(Envelope::new("t", 1, b"x".to_vec()), vec![]).expect("event"));
        broadcaster.deliver(&event);

        let replica = &replica;
        eventually("abandoned", || async move { replica.metrics().abandoned == 1 }).await;
        assert_eq!(replica.count().await.expect("count"), 0);
        assert_eq!(replica.shared.parked.lock().len(), 1);

        replica.request_repair();
        let cid = event.cid();
        eventually("stored by sweep", || async move {
            replica.heads().await.expect("heads") == vec![cid]
        })
        .await;
        assert!(replica.shared.parked.lock().is_empty());
        replica.close().await;
    }

    #[tokio::test]
    async fn fetched_duplicates_are_not_counted() {
        let (peer, chain) = peer_chain().await;
        let local = Arc::new(MemoryStore::new("chain"));
        local.insert_event(Arc::clone(&chain[0])).await.expect("seed");
        let replica = Replica::new(
            "chain",
            fast_config(),
            parts(local, ScriptedBroadcaster::new(), vec![peer as Arc<dyn Store>]),
            &CancellationToken::new(),
        );

        let shared = &replica.shared;
        assert!(shared.sync.push(Pending::new(Arc::clone(&chain[0])), &shared.cancel).await);
        assert!(shared.sync.push(Pending::new(Arc::clone(&chain[1])), &shared.cancel).await);

        let replica = &replica;
        eventually("second event stored", || async move {
            replica.count().await.expect("count") == 2
        })
        .await;
        assert_eq!(replica.metrics().received_sync, 1);
        replica.close().await;
    }
}
