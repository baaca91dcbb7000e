//! Node: the per-topic replica registry.
//!
//! A node owns one [`Replica`] per topic, created lazily on first publish,
//! subscription or explicit [`Node::ensure_topic`], and bootstraps a replica
//! for every topic already present in its store when it starts.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::ErrorCode;
use crate::event::{Cid, Envelope, Event};
use crate::net::{NodeBroadcaster, NodeSyncer};
use crate::query::{QueryPage, QueryRequest};
use crate::replica::{MetricsSnapshot, Replica, ReplicaError, ReplicaParts};
use crate::store::{NodeStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("unknown topic {0}")]
    UnknownTopic(String),

    #[error("a query must name exactly one topic, got {0}")]
    UnsupportedTopics(usize),

    #[error("topic {topic}: {source}")]
    Replica {
        topic: String,
        #[source]
        source: ReplicaError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl NodeError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownTopic(_) => ErrorCode::UnknownTopic,
            Self::UnsupportedTopics(_) => ErrorCode::UnsupportedTopics,
            Self::Replica { source, .. } => source.code(),
            Self::Store(err) => err.code(),
        }
    }

    fn replica(topic: &str) -> impl FnOnce(ReplicaError) -> Self + '_ {
        move |source| Self::Replica {
            topic: topic.to_owned(),
            source,
        }
    }
}

/// A topic's replica plus its live subscribers.
pub struct Topic {
    replica: Replica,
    subscribers: broadcast::Sender<Arc<Event>>,
}

impl Topic {
    #[must_use]
    pub const fn replica(&self) -> &Replica {
        &self.replica
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.subscribers.subscribe()
    }
}

pub struct Node {
    config: NodeConfig,
    store: Arc<dyn NodeStore>,
    syncer: Arc<dyn NodeSyncer>,
    broadcaster: Arc<dyn NodeBroadcaster>,
    cancel: CancellationToken,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl Node {
    /// Start a node and bootstrap every topic its store already holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot list its topics or any topic
    /// fails to bootstrap; every started replica is closed first.
    pub async fn new(
        config: NodeConfig,
        store: Arc<dyn NodeStore>,
        syncer: Arc<dyn NodeSyncer>,
        broadcaster: Arc<dyn NodeBroadcaster>,
    ) -> Result<Self, NodeError> {
        let node = Self {
            config,
            store,
            syncer,
            broadcaster,
            cancel: CancellationToken::new(),
            topics: RwLock::new(HashMap::new()),
        };

        let names = node.store.topics().await?;
        let mut existing = Vec::with_capacity(names.len());
        for name in &names {
            existing.push(node.topic_or_create(name)?);
        }

        let failures: Vec<NodeError> = stream::iter(existing)
            .map(|topic| async move {
                topic
                    .replica
                    .bootstrap()
                    .await
                    .map_err(NodeError::replica(topic.replica.topic()))
            })
            .buffer_unordered(node.config.bootstrap_parallelism.max(1))
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;

        if let Some(err) = failures.into_iter().next() {
            node.close().await;
            return Err(err);
        }
        info!(topics = names.len(), "node started");
        Ok(node)
    }

    fn topic_or_create(&self, name: &str) -> Result<Arc<Topic>, NodeError> {
        if let Some(topic) = self.topics.read().get(name) {
            return Ok(Arc::clone(topic));
        }

        let mut topics = self.topics.write();
        if let Some(topic) = topics.get(name) {
            return Ok(Arc::clone(topic));
        }

        let (subscribers, _) = broadcast::channel(self.config.subscriber_capacity.max(1));
        let feed = subscribers.clone();
        let parts = ReplicaParts {
            store: self.store.topic(name)?,
            broadcaster: self.broadcaster.topic(name),
            syncer: self.syncer.topic(name),
            observer: Some(Arc::new(move |event: &Arc<Event>| {
                // No receivers is fine.
                let _ = feed.send(Arc::clone(event));
            })),
        };
        let topic = Arc::new(Topic {
            replica: Replica::new(name, self.config.replica.clone(), parts, &self.cancel),
            subscribers,
        });
        topics.insert(name.to_owned(), Arc::clone(&topic));
        debug!(topic = name, "created topic");
        Ok(topic)
    }

    fn existing(&self, name: &str) -> Result<Arc<Topic>, NodeError> {
        self.topics
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NodeError::UnknownTopic(name.to_owned()))
    }

    /// Publish a local message on its envelope's topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic cannot be created, the store rejects the
    /// append, or the broadcast fails.
    pub async fn publish(&self, envelope: Envelope) -> Result<Arc<Event>, NodeError> {
        let topic = self.topic_or_create(&envelope.topic)?;
        let name = envelope.topic.clone();
        let event = topic
            .replica
            .broadcast_append(envelope)
            .await
            .map_err(NodeError::replica(&name))?;
        let _ = topic.subscribers.send(Arc::clone(&event));
        Ok(event)
    }

    /// Paginated read of a single topic.
    ///
    /// # Errors
    ///
    /// [`NodeError::UnsupportedTopics`] unless exactly one topic is named,
    /// [`NodeError::UnknownTopic`] if it has no replica, or the replica's
    /// query error (such as a stale cursor).
    pub async fn query(&self, topics: &[String], request: &QueryRequest) -> Result<QueryPage, NodeError> {
        let [name] = topics else {
            return Err(NodeError::UnsupportedTopics(topics.len()));
        };
        let topic = self.existing(name)?;
        topic
            .replica
            .query(request)
            .await
            .map_err(NodeError::replica(name))
    }

    /// # Errors
    ///
    /// [`NodeError::UnknownTopic`] if the topic has no replica, or a store
    /// failure.
    pub async fn get(&self, topic: &str, cid: Cid) -> Result<Option<Arc<Event>>, NodeError> {
        self.existing(topic)?
            .replica
            .get(cid)
            .await
            .map_err(NodeError::replica(topic))
    }

    /// Events stored across all topics.
    ///
    /// # Errors
    ///
    /// Returns the first store failure.
    pub async fn count(&self) -> Result<usize, NodeError> {
        let mut total = 0;
        for topic in self.topic_handles() {
            total += topic
                .replica
                .count()
                .await
                .map_err(NodeError::replica(topic.replica.topic()))?;
        }
        Ok(total)
    }

    /// Names of the topics this node replicates, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Live feed of events on `topic`: local publishes and events received
    /// by broadcast. Creates the topic if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic cannot be created.
    pub fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Arc<Event>>, NodeError> {
        Ok(self.topic_or_create(topic)?.subscribe())
    }

    /// Start replicating `topic` without publishing to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic cannot be created.
    pub fn ensure_topic(&self, topic: &str) -> Result<Arc<Topic>, NodeError> {
        let topic = self.topic_or_create(topic)?;
        topic.replica.request_repair();
        Ok(topic)
    }

    #[must_use]
    pub fn topic(&self, topic: &str) -> Option<Arc<Topic>> {
        self.topics.read().get(topic).cloned()
    }

    /// Metrics summed over every topic.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut total = MetricsSnapshot::default();
        for topic in self.topic_handles() {
            total += topic.replica.metrics();
        }
        total
    }

    fn topic_handles(&self) -> Vec<Arc<Topic>> {
        self.topics.read().values().cloned().collect()
    }

    /// Stop every replica and wait for their loops to exit.
    pub async fn close(&self) {
        self.cancel.cancel();
        for topic in self.topic_handles() {
            topic.replica.close().await;
        }
        if !self.topics.read().is_empty() {
            debug!("node closed");
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            warn!("node dropped without close; cancelling replicas");
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::net::{Broadcaster, NetError, Syncer};
    use crate::store::Store;
    use crate::store::memory::MemoryNodeStore;

    /// Transport with no peers: broadcasts vanish, fetches find nothing.
    struct Isolated;

    #[async_trait]
    impl Broadcaster for Isolated {
        async fn broadcast(&self, _event: Arc<Event>) -> Result<(), NetError> {
            Ok(())
        }

        async fn next(&self, cancel: &CancellationToken) -> Result<Arc<Event>, NetError> {
            cancel.cancelled().await;
            Err(NetError::Cancelled)
        }
    }

    #[async_trait]
    impl Syncer for Isolated {
        async fn fetch(&self, cids: &[Cid]) -> Result<Vec<Option<Arc<Event>>>, NetError> {
            Ok(vec![None; cids.len()])
        }
    }

    impl NodeBroadcaster for Isolated {
        fn topic(&self, _topic: &str) -> Arc<dyn Broadcaster> {
            Arc::new(Self)
        }
    }

    impl NodeSyncer for Isolated {
        fn topic(&self, _topic: &str) -> Arc<dyn Syncer> {
            Arc::new(Self)
        }
    }

    async fn isolated_node(store: Arc<MemoryNodeStore>) -> Node {
        Node::new(NodeConfig::default(), store, Arc::new(Isolated), Arc::new(Isolated))
            .await
            .expect("node starts")
    }

    #[tokio::test]
    async fn publish_creates_topic_and_chains_events() {
        let node = isolated_node(Arc::new(MemoryNodeStore::new())).await;
        assert!(node.topics().is_empty());

        let first = node.publish(Envelope::new("chat", 1, "hi")).await.expect("publish");
        let second = node.publish(Envelope::new("chat", 2, "there")).await.expect("publish");

        assert_eq!(node.topics(), vec!["chat".to_owned()]);
        assert_eq!(second.links(), &[first.cid()]);
        assert_eq!(node.count().await.expect("count"), 2);
        assert_eq!(
            node.get("chat", first.cid()).await.expect("get").map(|e| e.cid()),
            Some(first.cid())
        );
        node.close().await;
    }

    #[tokio::test]
    async fn query_needs_exactly_one_known_topic() {
        let node = isolated_node(Arc::new(MemoryNodeStore::new())).await;
        node.publish(Envelope::new("a", 1, "x")).await.expect("publish");
        let request = QueryRequest::default();

        let none = node.query(&[], &request).await;
        assert!(matches!(none, Err(NodeError::UnsupportedTopics(0))));

        let two = node.query(&["a".to_owned(), "b".to_owned()], &request).await;
        assert!(matches!(two, Err(NodeError::UnsupportedTopics(2))));

        let unknown = node.query(&["b".to_owned()], &request).await;
        let err = unknown.expect_err("unknown topic");
        assert_eq!(err.code(), ErrorCode::UnknownTopic);

        let page = node.query(&["a".to_owned()], &request).await.expect("query");
        assert_eq!(page.events.len(), 1);
        node.close().await;
    }

    #[tokio::test]
    async fn subscribers_see_local_publishes() {
        let node = isolated_node(Arc::new(MemoryNodeStore::new())).await;
        let mut feed = node.subscribe("news").expect("subscribe");
        let event = node.publish(Envelope::new("news", 7, "extra")).await.expect("publish");
        let seen = feed.recv().await.expect("delivered");
        assert_eq!(seen.cid(), event.cid());
        node.close().await;
    }

    #[tokio::test]
    async fn start_recreates_topics_found_in_store() {
        let store = Arc::new(MemoryNodeStore::new());
        store
            .memory_topic("old")
            .append_event(Envelope::new("old", 1, "kept"))
            .await
            .expect("seed");

        let node = isolated_node(Arc::clone(&store)).await;
        assert_eq!(node.topics(), vec!["old".to_owned()]);
        assert!(node.topic("old").is_some());
        assert!(node.topic("new").is_none());
        node.ensure_topic("new").expect("ensure");
        assert_eq!(node.topics(), vec!["new".to_owned(), "old".to_owned()]);
        node.close().await;
        assert!(node.topic("old").is_some_and(|t| t.replica().is_closed()));
    }
}
