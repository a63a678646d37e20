//! Integration tests for the Node public API over real UDP sockets.
//!
//! Every node binds an ephemeral localhost port; the embedded substrate
//! carries requests, responses, and transfer datagrams through the single
//! socket reader/writer pair.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::keccak256;
use portalium::{
    MemoryDb, Node, NodeConfig, RawContentKey, SubProtocolId,
};
use secp256k1::SecretKey;

fn test_config() -> NodeConfig {
    NodeConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        // Content-addressed namespace keeps payload fabrication trivial.
        supported_protocols: vec![SubProtocolId::CanonicalIndices],
        ..NodeConfig::default()
    }
}

fn indices_item(seed: u8, len: usize) -> (RawContentKey, Vec<u8>) {
    let payload = vec![seed; len];
    let mut key = vec![0x00];
    key.extend_from_slice(keccak256(&payload).as_slice());
    (RawContentKey(key), payload)
}

async fn wait_until<F, Fut>(deadline: Duration, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    loop {
        if probe().await {
            return;
        }
        assert!(
            started.elapsed() < deadline,
            "condition not reached within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn bootstrap_links_two_nodes() {
    let a = Node::bind(test_config()).await.expect("bind a");
    a.start().await.expect("start a");

    let mut config_b = test_config();
    config_b.bootnodes = vec![a.local_enr()];
    let b = Node::bind(config_b).await.expect("bind b");
    b.start().await.expect("start b");

    let overlay_a = a.overlay(SubProtocolId::CanonicalIndices).unwrap();
    let overlay_b = b.overlay(SubProtocolId::CanonicalIndices).unwrap();
    wait_until(Duration::from_secs(5), || async {
        overlay_b.table_len().await >= 1 && overlay_a.table_len().await >= 1
    })
    .await;
}

#[tokio::test]
async fn content_retrieval_inline_over_udp() {
    let a = Node::bind(test_config()).await.expect("bind a");
    a.start().await.expect("start a");

    let mut config_b = test_config();
    config_b.bootnodes = vec![a.local_enr()];
    let b = Node::bind(config_b).await.expect("bind b");
    b.start().await.expect("start b");

    let (key, payload) = indices_item(0x42, 500);
    a.overlay(SubProtocolId::CanonicalIndices)
        .unwrap()
        .store_content(key.clone(), payload.clone())
        .await
        .expect("store at a");

    let found = b
        .overlay(SubProtocolId::CanonicalIndices)
        .unwrap()
        .lookup_content(key)
        .await
        .expect("retrieval");
    assert_eq!(found.payload, payload);
    assert_eq!(found.source, a.node_id());
}

#[tokio::test]
async fn content_retrieval_via_bulk_transfer_over_udp() {
    let a = Node::bind(test_config()).await.expect("bind a");
    a.start().await.expect("start a");

    let mut config_b = test_config();
    config_b.bootnodes = vec![a.local_enr()];
    let b = Node::bind(config_b).await.expect("bind b");
    b.start().await.expect("start b");

    // Above the discovery ceiling: CONTENT answers with a connection id and
    // the payload rides the transfer channel.
    let (key, payload) = indices_item(0x55, 40_000);
    a.overlay(SubProtocolId::CanonicalIndices)
        .unwrap()
        .store_content(key.clone(), payload.clone())
        .await
        .expect("store at a");

    let found = b
        .overlay(SubProtocolId::CanonicalIndices)
        .unwrap()
        .lookup_content(key)
        .await
        .expect("retrieval");
    assert_eq!(found.payload.len(), payload.len());
    assert_eq!(found.payload, payload);
}

#[tokio::test]
async fn gossip_reaches_bootstrapped_peer() {
    let a = Node::bind(test_config()).await.expect("bind a");
    a.start().await.expect("start a");

    let mut config_b = test_config();
    config_b.bootnodes = vec![a.local_enr()];
    let b = Node::bind(config_b).await.expect("bind b");
    b.start().await.expect("start b");

    let overlay_a = a.overlay(SubProtocolId::CanonicalIndices).unwrap();
    let overlay_b = b.overlay(SubProtocolId::CanonicalIndices).unwrap();

    // a needs b's advertised radius before it will offer content.
    overlay_a
        .ping(&b.local_enr())
        .await
        .expect("radius exchange");

    let (key, payload) = indices_item(0x66, 2_000);
    overlay_a
        .store_content(key.clone(), payload.clone())
        .await
        .expect("store at a");

    wait_until(Duration::from_secs(5), || {
        let overlay_b = overlay_b.clone();
        let key = key.clone();
        async move { overlay_b.local_content(&key).await.unwrap() == Some(vec![0x66; 2_000]) }
    })
    .await;
    assert_eq!(overlay_b.content_count().await, 1);
}

#[tokio::test]
async fn third_node_discovered_through_lookup() {
    let a = Node::bind(test_config()).await.expect("bind a");
    a.start().await.expect("start a");

    let mut config_b = test_config();
    config_b.bootnodes = vec![a.local_enr()];
    let b = Node::bind(config_b).await.expect("bind b");
    b.start().await.expect("start b");

    let mut config_c = test_config();
    config_c.bootnodes = vec![a.local_enr()];
    let c = Node::bind(config_c).await.expect("bind c");
    c.start().await.expect("start c");

    // c's bootstrap self-lookup runs through a, which has met b by now.
    let overlay_c = c.overlay(SubProtocolId::CanonicalIndices).unwrap();
    let found = overlay_c.lookup_nodes(b.node_id().raw()).await;
    assert!(
        found
            .closest
            .iter()
            .any(|e| e.node_id() == b.node_id()),
        "c should discover b via a"
    );
}

#[tokio::test]
async fn rebuild_from_memory_restores_routing_state() {
    let a = Node::bind(test_config()).await.expect("bind a");
    a.start().await.expect("start a");

    let db = Arc::new(MemoryDb::new());
    let secret = SecretKey::new(&mut rand::rngs::OsRng);
    let mut config = test_config();
    config.bootnodes = vec![a.local_enr()];
    let b = Node::bind_with(config, secret, db.clone())
        .await
        .expect("bind b");
    b.start().await.expect("start b");

    let overlay_b = b.overlay(SubProtocolId::CanonicalIndices).unwrap();
    wait_until(Duration::from_secs(5), || async {
        overlay_b.table_len().await >= 1
    })
    .await;
    b.snapshot_routing().await.expect("snapshot");
    drop(b);

    // A new identity on the same backend relearns the table from the
    // snapshot without bootnodes.
    let secret2 = SecretKey::new(&mut rand::rngs::OsRng);
    let mut config2 = test_config();
    config2.rebuild_from_memory = true;
    let b2 = Node::bind_with(config2, secret2, db).await.expect("bind b2");
    b2.start().await.expect("start b2");

    let overlay_b2 = b2.overlay(SubProtocolId::CanonicalIndices).unwrap();
    wait_until(Duration::from_secs(5), || async {
        overlay_b2.table_len().await >= 1
    })
    .await;
}

#[tokio::test]
async fn observers_see_node_and_content_events() {
    use parking_lot::Mutex;
    use portalium::{NodeId, OverlayObserver};

    #[derive(Default)]
    struct Recorder {
        nodes: Mutex<Vec<NodeId>>,
        content: Mutex<Vec<Vec<u8>>>,
    }
    impl OverlayObserver for Recorder {
        fn on_node_added(&self, node: NodeId, _protocol: SubProtocolId) {
            self.nodes.lock().push(node);
        }
        fn on_content_added(
            &self,
            _protocol: SubProtocolId,
            key: &RawContentKey,
            _value: &[u8],
        ) {
            self.content.lock().push(key.0.clone());
        }
    }

    let a = Node::bind(test_config()).await.expect("bind a");
    a.start().await.expect("start a");
    let recorder = Arc::new(Recorder::default());
    let subscription = a.subscribe(recorder.clone());

    let mut config_b = test_config();
    config_b.bootnodes = vec![a.local_enr()];
    let b = Node::bind(config_b).await.expect("bind b");
    b.start().await.expect("start b");

    let (key, payload) = indices_item(0x77, 64);
    a.overlay(SubProtocolId::CanonicalIndices)
        .unwrap()
        .store_content(key.clone(), payload)
        .await
        .expect("store");

    wait_until(Duration::from_secs(5), || async {
        recorder.nodes.lock().contains(&b.node_id())
            && recorder.content.lock().contains(&key.0)
    })
    .await;

    assert!(a.unsubscribe(subscription));
}
