//! In-process transport with fault injection.
//!
//! Every node joins a shared [`MemNetwork`] and receives a [`MemTransport`]
//! that serves as both its broadcaster and its syncer. Broadcasts travel as
//! encoded bytes through per-topic inboxes and may be dropped, duplicated or
//! delayed (which reorders them). Fetches read straight from other attached
//! nodes' stores and may miss. A detached node neither sends nor receives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use plait_core::{
    Broadcaster, Cid, Event, NetError, NodeBroadcaster, NodeStore, NodeSyncer, Syncer,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::rng::DeterministicRng;

pub type NodeId = usize;

/// Fault injection applied to every send and fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Percentage of broadcast deliveries dropped, per receiver.
    pub drop_rate_percent: u8,
    /// Percentage of broadcast deliveries delivered twice.
    pub duplicate_rate_percent: u8,
    /// Upper bound of the random per-delivery delay.
    pub max_delay_ms: u64,
    /// Percentage of fetched ids a peer fails to return.
    pub fetch_miss_percent: u8,
}

impl FaultConfig {
    /// Lossless, immediate delivery.
    pub const NONE: Self = Self {
        drop_rate_percent: 0,
        duplicate_rate_percent: 0,
        max_delay_ms: 0,
        fetch_miss_percent: 0,
    };
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            drop_rate_percent: 5,
            duplicate_rate_percent: 3,
            max_delay_ms: 20,
            fetch_miss_percent: 5,
        }
    }
}

struct Peer {
    attached: bool,
    store: Arc<dyn NodeStore>,
    inboxes: HashMap<String, UnboundedSender<Vec<u8>>>,
}

struct NetState {
    rng: DeterministicRng,
    fault: FaultConfig,
    peers: Vec<Peer>,
}

struct Delivery {
    to: NodeId,
    inbox: UnboundedSender<Vec<u8>>,
    delay: Duration,
}

/// Shared medium connecting simulated nodes.
#[derive(Clone)]
pub struct MemNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemNetwork {
    #[must_use]
    pub fn new(seed: u64, fault: FaultConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState {
                rng: DeterministicRng::new(seed),
                fault,
                peers: Vec::new(),
            })),
        }
    }

    /// Register a node backed by `store`; it starts attached.
    #[must_use]
    pub fn join(&self, store: Arc<dyn NodeStore>) -> MemTransport {
        let mut state = self.state.lock();
        state.peers.push(Peer {
            attached: true,
            store,
            inboxes: HashMap::new(),
        });
        MemTransport {
            node: state.peers.len() - 1,
            net: self.clone(),
        }
    }

    /// Attach or detach a node. Messages in flight to a detached node are
    /// still delivered if they were sent before it left.
    pub fn set_attached(&self, node: NodeId, attached: bool) {
        if let Some(peer) = self.state.lock().peers.get_mut(node) {
            peer.attached = attached;
        }
    }

    #[must_use]
    pub fn is_attached(&self, node: NodeId) -> bool {
        self.state.lock().peers.get(node).is_some_and(|peer| peer.attached)
    }

    pub fn set_fault(&self, fault: FaultConfig) {
        self.state.lock().fault = fault;
    }

    #[must_use]
    pub fn fault(&self) -> FaultConfig {
        self.state.lock().fault
    }

    fn subscribe(&self, node: NodeId, topic: &str) -> UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = unbounded_channel();
        if let Some(peer) = self.state.lock().peers.get_mut(node) {
            peer.inboxes.insert(topic.to_owned(), tx);
        }
        rx
    }

    /// Decide, under the lock, who receives a broadcast and when.
    fn plan(&self, from: NodeId, topic: &str) -> Vec<Delivery> {
        let mut state = self.state.lock();
        let NetState { rng, fault, peers } = &mut *state;
        if !peers.get(from).is_some_and(|peer| peer.attached) {
            return Vec::new();
        }

        let mut plan = Vec::new();
        for (to, peer) in peers.iter().enumerate() {
            if to == from || !peer.attached {
                continue;
            }
            let Some(inbox) = peer.inboxes.get(topic) else {
                continue;
            };
            if rng.hit_rate_percent(fault.drop_rate_percent) {
                trace!(from, to, topic, "dropped broadcast");
                continue;
            }
            let copies = if rng.hit_rate_percent(fault.duplicate_rate_percent) { 2 } else { 1 };
            for _ in 0..copies {
                plan.push(Delivery {
                    to,
                    inbox: inbox.clone(),
                    delay: Duration::from_millis(rng.next_bounded(fault.max_delay_ms.saturating_add(1))),
                });
            }
        }
        plan
    }

    /// Stores of the other attached nodes, shuffled, plus a per-id miss
    /// mask. `None` when `from` is detached.
    fn fetch_plan(&self, from: NodeId, len: usize) -> Option<(Vec<Arc<dyn NodeStore>>, Vec<bool>)> {
        let mut state = self.state.lock();
        let NetState { rng, fault, peers } = &mut *state;
        if !peers.get(from).is_some_and(|peer| peer.attached) {
            return None;
        }
        let mut stores: Vec<Arc<dyn NodeStore>> = peers
            .iter()
            .enumerate()
            .filter(|(id, peer)| *id != from && peer.attached)
            .map(|(_, peer)| Arc::clone(&peer.store))
            .collect();
        rng.shuffle(&mut stores);
        let misses = (0..len)
            .map(|_| rng.hit_rate_percent(fault.fetch_miss_percent))
            .collect();
        Some((stores, misses))
    }
}

/// One node's view of the [`MemNetwork`].
#[derive(Clone)]
pub struct MemTransport {
    node: NodeId,
    net: MemNetwork,
}

impl MemTransport {
    #[must_use]
    pub const fn node(&self) -> NodeId {
        self.node
    }
}

impl NodeBroadcaster for MemTransport {
    fn topic(&self, topic: &str) -> Arc<dyn Broadcaster> {
        Arc::new(MemBroadcaster {
            node: self.node,
            topic: topic.to_owned(),
            net: self.net.clone(),
            inbox: tokio::sync::Mutex::new(self.net.subscribe(self.node, topic)),
        })
    }
}

impl NodeSyncer for MemTransport {
    fn topic(&self, topic: &str) -> Arc<dyn Syncer> {
        Arc::new(MemSyncer {
            node: self.node,
            topic: topic.to_owned(),
            net: self.net.clone(),
        })
    }
}

struct MemBroadcaster {
    node: NodeId,
    topic: String,
    net: MemNetwork,
    inbox: tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl Broadcaster for MemBroadcaster {
    async fn broadcast(&self, event: Arc<Event>) -> Result<(), NetError> {
        let bytes = event.to_bytes();
        for delivery in self.net.plan(self.node, &self.topic) {
            let payload = bytes.clone();
            if delivery.delay.is_zero() {
                let _ = delivery.inbox.send(payload);
                continue;
            }
            let to = delivery.to;
            tokio::spawn(async move {
                tokio::time::sleep(delivery.delay).await;
                if delivery.inbox.send(payload).is_err() {
                    trace!(to, "receiver gone before delayed delivery");
                }
            });
        }
        Ok(())
    }

    async fn next(&self, cancel: &CancellationToken) -> Result<Arc<Event>, NetError> {
        let mut inbox = self.inbox.lock().await;
        loop {
            let bytes = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(NetError::Cancelled),
                bytes = inbox.recv() => bytes.ok_or(NetError::Closed)?,
            };
            let event = Event::from_bytes(&bytes)?;
            if event.verify()? {
                return Ok(Arc::new(event));
            }
            warn!(node = self.node, topic = %self.topic, cid = %event.cid().short(), "discarding event with mismatched id");
        }
    }
}

struct MemSyncer {
    node: NodeId,
    topic: String,
    net: MemNetwork,
}

#[async_trait]
impl Syncer for MemSyncer {
    async fn fetch(&self, cids: &[Cid]) -> Result<Vec<Option<Arc<Event>>>, NetError> {
        let Some((stores, misses)) = self.net.fetch_plan(self.node, cids.len()) else {
            return Err(NetError::NoPeers(self.topic.clone()));
        };
        if stores.is_empty() {
            return Err(NetError::NoPeers(self.topic.clone()));
        }

        let mut found = Vec::with_capacity(cids.len());
        for (cid, missed) in cids.iter().zip(misses) {
            if missed {
                found.push(None);
                continue;
            }
            let mut hit = None;
            for store in &stores {
                let peer = store
                    .topic(&self.topic)
                    .map_err(|err| NetError::Transport(err.to_string()))?;
                if let Some(event) = peer
                    .get(*cid)
                    .await
                    .map_err(|err| NetError::Transport(err.to_string()))?
                {
                    // Round-trip through the wire format like a real peer.
                    hit = Some(Arc::new(Event::from_bytes(&event.to_bytes())?));
                    break;
                }
            }
            found.push(hit);
        }
        Ok(found)
    }
}
