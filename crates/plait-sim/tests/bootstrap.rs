use std::sync::Arc;
use std::time::Duration;

use plait_core::config::{NodeConfig, ReplicaConfig};
use plait_core::error::ErrorCode;
use plait_core::store::memory::MemoryNodeStore;
use plait_core::{Envelope, NodeStore, QueryRequest, Store};
use plait_sim::Network;
use plait_sim::network::FaultConfig;

fn fast_config() -> NodeConfig {
    NodeConfig {
        replica: ReplicaConfig {
            retry_backoff_ms: 5,
            max_backoff_ms: 20,
            max_attempts: 3,
            repair_interval_ms: 100,
            ..ReplicaConfig::default()
        },
        ..NodeConfig::default()
    }
}

async fn eventually<F, Fut>(mut check: F)
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
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_node_fetches_links_missing_from_its_store() {
    let mut network = Network::new(11, FaultConfig::NONE, fast_config());
    let source = network.add_memory_nodes(1).await.expect("node")[0];
    let mut last = None;
    for ts in 1..=4 {
        last = Some(
            network
                .node(source)
                .publish(Envelope::new("history", ts, format!("v{ts}")))
                .await
                .expect("publish"),
        );
    }
    let last = last.expect("published");

    // A store that only holds the newest event, as after a partial copy.
    let partial = Arc::new(MemoryNodeStore::new());
    partial
        .memory_topic("history")
        .insert_event(Arc::clone(&last))
        .await
        .expect("seed");
    assert_eq!(
        partial.memory_topic("history").find_missing_links().await.expect("missing").len(),
        1
    );

    let restarted = network
        .add_node(Arc::clone(&partial) as Arc<dyn NodeStore>)
        .await
        .expect("node");
    assert_eq!(network.node(restarted).topics(), vec!["history".to_owned()]);

    let store = partial.memory_topic("history");
    eventually(|| {
        let store = Arc::clone(&store);
        async move { store.count().await.expect("count") == 4 }
    })
    .await;
    assert!(store.find_missing_links().await.expect("missing").is_empty());

    let page = network
        .node(restarted)
        .query(&["history".to_owned()], &QueryRequest::default().with_limit(2).descending())
        .await
        .expect("query");
    let stamps: Vec<u64> = page.events.iter().map(|e| e.timestamp_ns()).collect();
    assert_eq!(stamps, vec![4, 3]);
    assert!(page.cursor.is_some());
    network.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn isolated_node_starts_and_gives_up_on_unreachable_links() {
    let mut network = Network::new(12, FaultConfig::NONE, fast_config());
    let writer = network.add_memory_nodes(1).await.expect("node")[0];
    let a = network
        .node(writer)
        .publish(Envelope::new("lonely", 1, "a"))
        .await
        .expect("publish");
    let b = network
        .node(writer)
        .publish(Envelope::new("lonely", 2, "b"))
        .await
        .expect("publish");
    assert_eq!(b.links(), &[a.cid()]);
    network.detach(writer);

    let partial = Arc::new(MemoryNodeStore::new());
    partial
        .memory_topic("lonely")
        .insert_event(Arc::clone(&b))
        .await
        .expect("seed");
    let lonely = network
        .add_node(Arc::clone(&partial) as Arc<dyn NodeStore>)
        .await
        .expect("starts without peers");

    let net = &network;
    eventually(|| async move { net.node(lonely).metrics().abandoned > 0 }).await;
    assert!(network.node(lonely).metrics().fetch_errors > 0);
    assert_eq!(
        partial.memory_topic("lonely").find_missing_links().await.expect("missing"),
        vec![a.cid()]
    );

    // Reattaching the writer lets the next sweep resolve the gap.
    network.attach(writer);
    network.attach(lonely);
    let store = partial.memory_topic("lonely");
    eventually(|| {
        let store = Arc::clone(&store);
        async move { store.count().await.expect("count") == 2 }
    })
    .await;
    network.close().await;
}

#[tokio::test]
async fn queries_name_one_known_topic() {
    let mut network = Network::new(13, FaultConfig::NONE, fast_config());
    let id = network.add_memory_nodes(1).await.expect("node")[0];
    let node = network.node(id);

    let err = node
        .query(&["nowhere".to_owned()], &QueryRequest::default())
        .await
        .expect_err("unknown topic");
    assert_eq!(err.code(), ErrorCode::UnknownTopic);

    let err = node
        .query(&["a".to_owned(), "b".to_owned()], &QueryRequest::default())
        .await
        .expect_err("two topics");
    assert_eq!(err.code(), ErrorCode::UnsupportedTopics);
    network.close().await;
}
