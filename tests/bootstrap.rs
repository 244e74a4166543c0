#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{make_peer_info, NetworkRegistry, TestNode};
use meshnet::{bootstrap, BootstrapConfig, MeshError};
use tokio_util::sync::CancellationToken;

fn fast_config(seeds: Vec<meshnet::PeerInfo>) -> BootstrapConfig {
    BootstrapConfig {
        seeds,
        refresh_interval: Duration::from_secs(1),
        dial_timeout: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn bootstrap_succeeds_with_partially_reachable_seeds() {
    let registry = Arc::new(NetworkRegistry::default());
    let joiner = TestNode::new(registry.clone(), 0x01, 20).await;
    let seed_one = TestNode::new(registry.clone(), 0x02, 20).await;
    let seed_two = TestNode::new(registry.clone(), 0x03, 20).await;
    // Third seed is never registered, so it is unreachable.
    let dead_seed = make_peer_info(0x04);

    let config = fast_config(vec![seed_one.info(), seed_two.info(), dead_seed.clone()]);
    let report = bootstrap(&joiner.discovery, &config, CancellationToken::new())
        .await
        .expect("two of three seeds reachable");

    assert_eq!(report.attempted, 3);
    assert_eq!(report.connected, 2);
    assert!(joiner.discovery.table_size().await >= 2);
    assert!(joiner.discovery.contains(&seed_one.info().id).await);
    assert!(joiner.discovery.contains(&seed_two.info().id).await);
    // The unreachable seed must not linger in the table.
    assert!(!joiner.discovery.contains(&dead_seed.id).await);
}

#[tokio::test]
async fn bootstrap_fails_when_no_seed_is_reachable() {
    let registry = Arc::new(NetworkRegistry::default());
    let joiner = TestNode::new(registry.clone(), 0x10, 20).await;

    let seeds = vec![make_peer_info(0x11), make_peer_info(0x12)];
    let config = fast_config(seeds);
    let err = bootstrap(&joiner.discovery, &config, CancellationToken::new())
        .await
        .expect_err("all seeds unreachable");

    match err {
        MeshError::BootstrapUnreachable { attempted } => assert_eq!(attempted, 2),
        other => panic!("expected BootstrapUnreachable, got {other:?}"),
    }
    // The routing table is exactly as it was before the call.
    assert_eq!(joiner.discovery.table_size().await, 0);
}

#[tokio::test]
async fn bootstrap_without_seeds_falls_back_to_defaults_and_fails_fast() {
    let registry = Arc::new(NetworkRegistry::default());
    let joiner = TestNode::new(registry.clone(), 0x20, 20).await;

    // No seeds configured: the built-in set is dialed, and none of its
    // members exist in this network, so bootstrap must fail within the
    // dial timeout rather than hang.
    let config = fast_config(Vec::new());
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        bootstrap(&joiner.discovery, &config, CancellationToken::new()),
    )
    .await
    .expect("bootstrap returns within the bound");

    match result {
        Err(MeshError::BootstrapUnreachable { .. }) => {}
        other => panic!("expected BootstrapUnreachable, got {other:?}"),
    }
    assert_eq!(joiner.discovery.table_size().await, 0);
}

#[tokio::test]
async fn bootstrap_discovers_peers_known_to_the_seed() {
    let registry = Arc::new(NetworkRegistry::default());
    let seed = TestNode::new(registry.clone(), 0x30, 20).await;
    let veteran = TestNode::new(registry.clone(), 0x31, 20).await;
    let joiner = TestNode::new(registry.clone(), 0x32, 20).await;

    // The seed already knows about another member of the mesh.
    seed.discovery.observe_peer(veteran.info()).await;

    let config = fast_config(vec![seed.info()]);
    bootstrap(&joiner.discovery, &config, CancellationToken::new())
        .await
        .expect("seed reachable");

    assert!(joiner.discovery.contains(&seed.info().id).await);
    assert!(joiner.discovery.contains(&veteran.info().id).await);
}

#[tokio::test]
async fn nodes_bootstrapping_through_each_other_discover_mutually() {
    let registry = Arc::new(NetworkRegistry::default());
    let anchor = TestNode::new(registry.clone(), 0x40, 20).await;
    let joiner = TestNode::new(registry.clone(), 0x41, 20).await;

    let config = fast_config(vec![anchor.info()]);
    bootstrap(&joiner.discovery, &config, CancellationToken::new())
        .await
        .expect("anchor reachable");

    // The joiner learned the anchor, and the anchor observed the
    // joiner while answering its dial.
    assert!(joiner.discovery.table_size().await >= 1);
    assert!(anchor.discovery.table_size().await >= 1);
    assert!(joiner.discovery.contains(&anchor.info().id).await);
    assert!(anchor.discovery.contains(&joiner.info().id).await);
}

#[tokio::test]
async fn known_seed_is_still_redialed() {
    let registry = Arc::new(NetworkRegistry::default());
    let seed = TestNode::new(registry.clone(), 0x50, 20).await;
    let joiner = TestNode::new(registry.clone(), 0x51, 20).await;

    // Seed already present in the table before bootstrap runs.
    joiner.discovery.observe_peer(seed.info()).await;

    let config = fast_config(vec![seed.info()]);
    let report = bootstrap(&joiner.discovery, &config, CancellationToken::new())
        .await
        .expect("seed reachable");
    assert_eq!(report.connected, 1);
    assert!(joiner.discovery.contains(&seed.info().id).await);

    // Bootstrapping again is idempotent.
    let report = bootstrap(&joiner.discovery, &config, CancellationToken::new())
        .await
        .expect("seed still reachable");
    assert_eq!(report.connected, 1);
}

#[tokio::test]
async fn iterative_lookup_walks_beyond_the_first_hop() {
    let registry = Arc::new(NetworkRegistry::default());
    let origin = TestNode::new(registry.clone(), 0x60, 20).await;
    let relay = TestNode::new(registry.clone(), 0x61, 20).await;
    let distant = TestNode::new(registry.clone(), 0x62, 20).await;

    // origin only knows relay; relay knows distant.
    origin.discovery.observe_peer(relay.info()).await;
    relay.discovery.observe_peer(distant.info()).await;

    let found = origin
        .discovery
        .find_closest(distant.info().dht_id())
        .await
        .expect("lookup succeeds");

    assert!(found.iter().any(|p| p.id == distant.info().id));
    assert!(origin.discovery.contains(&distant.info().id).await);
}

#[tokio::test]
async fn lookup_tolerates_failing_peers() {
    let registry = Arc::new(NetworkRegistry::default());
    let origin = TestNode::new(registry.clone(), 0x70, 20).await;
    let healthy = TestNode::new(registry.clone(), 0x71, 20).await;
    let flaky = TestNode::new(registry.clone(), 0x72, 20).await;

    origin.discovery.observe_peer(healthy.info()).await;
    origin.discovery.observe_peer(flaky.info()).await;
    origin.network.set_failure(flaky.info().id, true).await;

    let found = origin
        .discovery
        .find_closest(common::make_peer_info(0x7F).dht_id())
        .await
        .expect("lookup tolerates individual failures");

    assert!(found.iter().any(|p| p.id == healthy.info().id));
}
