//! plait-sim library.
//!
//! Runs several [`plait_core::Node`]s in one process over a
//! fault-injecting [`network::MemNetwork`] and checks that every node ends
//! up with the same events per topic.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod network;
pub mod rng;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use plait_core::config::NodeConfig;
use plait_core::replica::MetricsSnapshot;
use plait_core::store::memory::MemoryNodeStore;
use plait_core::{Cid, Envelope, Node, NodeStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::network::{FaultConfig, MemNetwork, NodeId};
use crate::rng::DeterministicRng;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A set of nodes sharing one simulated network.
pub struct Network {
    net: MemNetwork,
    config: NodeConfig,
    nodes: BTreeMap<NodeId, Node>,
}

/// Per-topic agreement across nodes at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Convergence {
    pub converged: bool,
    /// Distinct events per topic, union over all nodes.
    pub events: BTreeMap<String, usize>,
    /// For each topic, how many events each node lacks, by node id. Only
    /// nodes that lack something are listed.
    pub missing: BTreeMap<String, BTreeMap<NodeId, usize>>,
}

impl Network {
    #[must_use]
    pub fn new(seed: u64, fault: FaultConfig, config: NodeConfig) -> Self {
        Self {
            net: MemNetwork::new(seed, fault),
            config,
            nodes: BTreeMap::new(),
        }
    }

    /// Start a node over `store` and attach it to the network.
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails to bootstrap.
    pub async fn add_node(&mut self, store: Arc<dyn NodeStore>) -> Result<NodeId> {
        let transport = self.net.join(Arc::clone(&store));
        let id = transport.node();
        let started = Node::new(
            self.config.clone(),
            store,
            Arc::new(transport.clone()),
            Arc::new(transport),
        )
        .await;
        let node = match started {
            Ok(node) => node,
            Err(err) => {
                self.net.set_attached(id, false);
                return Err(err).with_context(|| format!("starting node {id}"));
            }
        };
        self.nodes.insert(id, node);
        debug!(node = id, "node joined");
        Ok(id)
    }

    /// Start `count` nodes, each with a fresh in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if any node fails to start.
    pub async fn add_memory_nodes(&mut self, count: usize) -> Result<Vec<NodeId>> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.add_node(Arc::new(MemoryNodeStore::new())).await?);
        }
        Ok(ids)
    }

    /// # Panics
    ///
    /// Panics if `id` was not returned by [`Network::add_node`].
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[&id]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Make every node replicate `topic`, so none misses its broadcasts.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot create the topic.
    pub fn ensure_topic(&self, topic: &str) -> Result<()> {
        for node in self.nodes.values() {
            node.ensure_topic(topic)?;
        }
        Ok(())
    }

    pub fn detach(&self, id: NodeId) {
        self.net.set_attached(id, false);
    }

    /// Reattach a node and ask each of its topics for a repair sweep.
    pub fn attach(&self, id: NodeId) {
        self.net.set_attached(id, true);
        if let Some(node) = self.nodes.get(&id) {
            for topic in node.topics() {
                if let Some(handle) = node.topic(&topic) {
                    handle.replica().request_repair();
                }
            }
        }
    }

    #[must_use]
    pub fn is_attached(&self, id: NodeId) -> bool {
        self.net.is_attached(id)
    }

    pub fn set_fault(&self, fault: FaultConfig) {
        self.net.set_fault(fault);
    }

    /// Publish on every node and topic so each node's heads reach everyone.
    ///
    /// After faults stop, one reliably delivered event per node and topic is
    /// enough for every peer to fetch the rest through its links.
    ///
    /// # Errors
    ///
    /// Returns an error if any publish fails.
    pub async fn flush(&self, topics: &[String], timestamp_ns: u64) -> Result<()> {
        for (id, node) in &self.nodes {
            for topic in topics {
                node
                    .publish(Envelope::new(topic.as_str(), timestamp_ns, format!("flush from {id}")))
                    .await
                    .with_context(|| format!("flushing {topic} on node {id}"))?;
            }
        }
        Ok(())
    }

    /// Compare every node's stored ids for each topic.
    ///
    /// # Errors
    ///
    /// Returns an error if a store cannot list its events.
    pub async fn convergence(&self, topics: &[String]) -> Result<Convergence> {
        let mut report = Convergence {
            converged: true,
            ..Convergence::default()
        };
        for topic in topics {
            let mut per_node: Vec<(NodeId, BTreeSet<Cid>)> = Vec::with_capacity(self.nodes.len());
            for (id, node) in &self.nodes {
                let cids = match node.topic(topic) {
                    Some(handle) => handle
                        .replica()
                        .events()
                        .await?
                        .iter()
                        .map(|event| event.cid())
                        .collect(),
                    None => BTreeSet::new(),
                };
                per_node.push((*id, cids));
            }

            let union: BTreeSet<Cid> = per_node.iter().flat_map(|(_, cids)| cids).copied().collect();
            let lacking: BTreeMap<NodeId, usize> = per_node
                .iter()
                .filter(|(_, cids)| cids.len() < union.len())
                .map(|(id, cids)| (*id, union.len() - cids.len()))
                .collect();
            if !lacking.is_empty() {
                report.converged = false;
                report.missing.insert(topic.clone(), lacking);
            }
            report.events.insert(topic.clone(), union.len());
        }
        Ok(report)
    }

    /// Poll [`Network::convergence`] until every topic agrees or `timeout`
    /// passes. Returns the last observation either way.
    ///
    /// # Errors
    ///
    /// Returns an error if a store cannot list its events.
    pub async fn wait_converged(&self, topics: &[String], timeout: Duration) -> Result<Convergence> {
        let deadline = Instant::now() + timeout;
        loop {
            let report = self.convergence(topics).await?;
            if report.converged || Instant::now() >= deadline {
                return Ok(report);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Metrics summed over every node.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut total = MetricsSnapshot::default();
        for node in self.nodes.values() {
            total += node.metrics();
        }
        total
    }

    pub async fn close(&self) {
        for node in self.nodes.values() {
            node.close().await;
        }
        debug!(nodes = self.nodes.len(), "network closed");
    }
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

/// Randomized publish workload with faults and partitions, followed by a
/// fault-free settle phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    pub nodes: usize,
    pub topics: Vec<String>,
    pub rounds: u64,
    pub messages_per_round: usize,
    /// Pause between rounds, letting deliveries and repairs interleave.
    pub round_delay_ms: u64,
    /// Percentage chance per round to detach or reattach a random node.
    pub partition_rate_percent: u8,
    pub settle_timeout_ms: u64,
    pub fault: FaultConfig,
    pub node: NodeConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            nodes: 4,
            topics: vec!["general".to_owned(), "random".to_owned()],
            rounds: 20,
            messages_per_round: 3,
            round_delay_ms: 5,
            partition_rate_percent: 5,
            settle_timeout_ms: 10_000,
            fault: FaultConfig::default(),
            node: NodeConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            bail!("nodes must be > 0");
        }
        if self.topics.is_empty() {
            bail!("topics must not be empty");
        }
        if self.topics.iter().any(String::is_empty) {
            bail!("topic names must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub seed: u64,
    /// Workload events, excluding the final flush.
    pub published: usize,
    pub partitions: usize,
    pub settle_ms: u64,
    pub convergence: Convergence,
    pub metrics: MetricsSnapshot,
}

/// Run one seeded scenario to completion.
///
/// # Errors
///
/// Returns an error for an invalid config or a node failure. A run that
/// does not converge is reported, not an error.
pub async fn run_simulation(config: &SimulationConfig) -> Result<SimulationReport> {
    config.validate()?;
    let mut rng = DeterministicRng::new(config.seed).fork(1);
    let mut network = Network::new(config.seed, config.fault, config.node.clone());
    let ids = network.add_memory_nodes(config.nodes).await?;
    for topic in &config.topics {
        network.ensure_topic(topic)?;
    }

    let mut published = 0usize;
    let mut partitions = 0usize;
    let mut clock = 0u64;
    for round in 0..config.rounds {
        if rng.hit_rate_percent(config.partition_rate_percent) {
            let id = ids[rng.pick(ids.len())];
            if network.is_attached(id) {
                network.detach(id);
                partitions += 1;
                debug!(round, node = id, "detached");
            } else {
                network.attach(id);
                debug!(round, node = id, "reattached");
            }
        }

        for _ in 0..config.messages_per_round {
            let id = ids[rng.pick(ids.len())];
            let topic = &config.topics[rng.pick(config.topics.len())];
            clock += 1;
            network
                .node(id)
                .publish(Envelope::new(topic.as_str(), clock, format!("round {round} message {clock}")))
                .await
                .with_context(|| format!("publishing on node {id}"))?;
            published += 1;
        }
        tokio::time::sleep(Duration::from_millis(config.round_delay_ms)).await;
    }

    network.set_fault(FaultConfig::NONE);
    for &id in &ids {
        network.attach(id);
    }
    let started = Instant::now();
    network.flush(&config.topics, clock + 1).await?;
    let convergence = network
        .wait_converged(&config.topics, Duration::from_millis(config.settle_timeout_ms))
        .await?;
    let settle_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    if convergence.converged {
        info!(seed = config.seed, published, settle_ms, "converged");
    } else {
        warn!(seed = config.seed, missing = ?convergence.missing, "did not converge");
    }

    let metrics = network.metrics();
    network.close().await;
    Ok(SimulationReport {
        seed: config.seed,
        published,
        partitions,
        settle_ms,
        convergence,
        metrics,
    })
}
