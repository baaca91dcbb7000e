//! In-memory storage engine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{NodeStore, Store, StoreError};
use crate::event::{Cid, Envelope, Event, TimeKey};
use crate::query::{self, QueryError, QueryPage, QueryRequest};

#[derive(Debug, Default)]
struct TopicState {
    events: HashMap<Cid, Arc<Event>>,
    heads: HashSet<Cid>,
    /// Every id some stored event links to, stored or not.
    referenced: HashSet<Cid>,
    by_time: BTreeMap<TimeKey, Arc<Event>>,
}

impl TopicState {
    fn insert(&mut self, event: &Arc<Event>) -> bool {
        let cid = event.cid();
        if self.events.contains_key(&cid) {
            return false;
        }
        self.events.insert(cid, Arc::clone(event));
        self.by_time.insert(event.time_key(), Arc::clone(event));
        self.referenced.extend(event.links().iter().copied());
        true
    }
}

/// One topic's events held behind a `parking_lot::RwLock`.
#[derive(Debug)]
pub struct MemoryStore {
    topic: String,
    state: RwLock<TopicState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: RwLock::new(TopicState::default()),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn is_empty(&self) -> bool {
        self.state.read().events.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_event(&self, envelope: Envelope) -> Result<Arc<Event>, StoreError> {
        let mut state = self.state.write();
        let mut links: Vec<Cid> = state.heads.iter().copied().collect();
        links.sort_unstable();

        let event = Arc::new(Event::new(envelope, links)?);
        state.insert(&event);
        state.heads.clear();
        state.heads.insert(event.cid());
        Ok(event)
    }

    async fn insert_event(&self, event: Arc<Event>) -> Result<bool, StoreError> {
        Ok(self.state.write().insert(&event))
    }

    async fn insert_head(&self, event: Arc<Event>) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let added = state.insert(&event);
        if added && !state.referenced.contains(&event.cid()) {
            state.heads.insert(event.cid());
        }
        Ok(added)
    }

    async fn remove_head(&self, cid: Cid) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        if !state.events.contains_key(&cid) {
            return Ok(false);
        }
        state.heads.remove(&cid);
        Ok(true)
    }

    async fn find_missing_links(&self) -> Result<Vec<Cid>, StoreError> {
        let state = self.state.read();
        let mut missing: Vec<Cid> = state
            .referenced
            .iter()
            .filter(|cid| !state.events.contains_key(cid))
            .copied()
            .collect();
        missing.sort_unstable();
        Ok(missing)
    }

    async fn events(&self) -> Result<Vec<Arc<Event>>, StoreError> {
        Ok(self.state.read().by_time.values().cloned().collect())
    }

    async fn heads(&self) -> Result<Vec<Cid>, StoreError> {
        let mut heads: Vec<Cid> = self.state.read().heads.iter().copied().collect();
        heads.sort_unstable();
        Ok(heads)
    }

    async fn get_events(&self, cids: &[Cid]) -> Result<Vec<Arc<Event>>, StoreError> {
        let state = self.state.read();
        Ok(cids
            .iter()
            .filter_map(|cid| state.events.get(cid).cloned())
            .collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().events.len())
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, QueryError> {
        query::scan(&self.state.read().by_time, request)
    }
}

/// Per-topic [`MemoryStore`]s created on first use.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    topics: RwLock<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryNodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle for `topic`, for callers that need more than the
    /// [`Store`] contract.
    #[must_use]
    pub fn memory_topic(&self, topic: &str) -> Arc<MemoryStore> {
        if let Some(store) = self.topics.read().get(topic) {
            return Arc::clone(store);
        }
        let mut topics = self.topics.write();
        Arc::clone(
            topics
                .entry(topic.to_owned())
                .or_insert_with(|| Arc::new(MemoryStore::new(topic))),
        )
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    fn topic(&self, topic: &str) -> Result<Arc<dyn Store>, StoreError> {
        Ok(self.memory_topic(topic))
    }

    async fn topics(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .topics
            .read()
            .iter()
            .filter(|(_, store)| !store.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_unstable();
        Ok(names)
    }
}
