mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{reply_of, Net};
use meshrpc_broker::discovery::{DiscoveryClient, StaticDiscovery};
use meshrpc_broker::upstream::{UpstreamConfig, UpstreamManager};
use meshrpc_broker::MeshError;
use meshrpc_core::Payload;

const DEST: &str = "math!Calc:1";

fn uris(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| format!("local://{n}")).collect()
}

#[tokio::test]
async fn refresh_drops_an_endpoint_and_fails_its_in_flight_call() {
    let net = Net::new();
    net.provider("a", Duration::ZERO).await;
    net.provider("b", Duration::from_secs(3600)).await;
    let manager = Arc::new(UpstreamManager::new(Arc::clone(&net.transports), UpstreamConfig::default()));
    let cluster = manager.get_or_create(DEST);
    cluster.refresh_uris(uris(&["a", "b"])).await;

    let pending = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move { cluster.request_response_to("local://b", Payload::data("x")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let summary = cluster.refresh_uris(uris(&["a"])).await;
    assert_eq!(summary.removed, vec!["local://b"]);
    assert!(matches!(pending.await.unwrap(), Err(MeshError::ConnectionClosed { .. })));

    for _ in 0..3 {
        let reply = cluster.request_response(Payload::data("x"), None).await.unwrap();
        assert_eq!(reply_of(&reply), "a");
    }
}

#[tokio::test]
async fn round_robin_pool_cycles_in_order() {
    let net = Net::new();
    for name in ["a", "b", "c"] {
        net.provider(name, Duration::ZERO).await;
    }
    let manager = UpstreamManager::new(Arc::clone(&net.transports), UpstreamConfig::default());
    let cluster = manager.get_or_create(DEST);
    cluster.refresh_uris(uris(&["a", "b", "c"])).await;

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(reply_of(&cluster.request_response(Payload::data("x"), None).await.unwrap()));
    }
    assert_eq!(seen, vec!["a", "b", "c", "a"]);
}

#[tokio::test]
async fn discovery_refresh_follows_the_resolved_set() {
    let net = Net::new();
    for name in ["a", "b"] {
        net.provider(name, Duration::ZERO).await;
    }
    let manager = UpstreamManager::new(Arc::clone(&net.transports), UpstreamConfig::default());
    let cluster = manager.get_or_create(DEST);
    let discovery = StaticDiscovery::new().with(DEST, uris(&["a", "b"]));

    let client: &dyn DiscoveryClient = &discovery;
    manager.refresh_all(Some(client)).await;
    assert_eq!(*cluster.uris(), uris(&["a", "b"]));

    discovery.set(DEST, uris(&["b"]));
    manager.refresh_all(Some(client)).await;
    assert_eq!(*cluster.uris(), uris(&["b"]));
    assert_eq!(reply_of(&cluster.request_response(Payload::data("x"), None).await.unwrap()), "b");
}
