//! Fleet-state tests: dead-owner recovery, eviction, and placement over a
//! staged store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use room_router::store::{LocalStore, NodeRegistry, RoomDirectory};
use room_router::{LocalRouter, ParticipantInit, RandomSelector, Router, RouterConfig, RouterError};
use router_proto::internal::{Node, NodeStats};
use std::sync::Arc;
use std::time::Duration;

fn stale_node(id: &str, age_seconds: i64) -> Node {
    let now = chrono::Utc::now().timestamp();
    Node {
        id: id.to_string(),
        ip: "10.0.0.9".to_string(),
        num_cpus: 4,
        stats: Some(NodeStats {
            started_at: now - 3600,
            updated_at: now - age_seconds,
            ..NodeStats::default()
        }),
    }
}

fn test_config(node_id: &str) -> RouterConfig {
    RouterConfig {
        node_id: node_id.to_string(),
        drain_grace: Duration::from_millis(100),
        ..RouterConfig::default()
    }
}

fn router_over(store: Arc<LocalStore>, node_id: &str) -> LocalRouter {
    let config = test_config(node_id);
    let selector = Box::new(RandomSelector::with_seed(config.expire_after, 3));
    let router = LocalRouter::with_store(config, selector, store);
    router.on_new_participant(Arc::new(|_, _, _, _| {}));
    router.on_rtc_message(Arc::new(|_, _, _| {}));
    router
}

#[tokio::test]
async fn test_join_recovers_from_dead_owner() {
    let store = Arc::new(LocalStore::new(Duration::from_secs(10)));

    // roomC was owned by a node that stopped heartbeating long ago.
    store.register_node(stale_node("nd-dead", 120)).await.unwrap();
    store.set_node_for_room("roomC", "nd-dead").await.unwrap();

    let router = router_over(Arc::clone(&store), "nd-live");
    router.start().await.unwrap();

    let connection = router
        .start_participant_signal(
            "roomC",
            ParticipantInit {
                identity: "carol".to_string(),
                ..ParticipantInit::default()
            },
        )
        .await
        .expect("join must recover by reassigning the room");
    assert!(!connection.connection_id.is_empty());

    // The stale binding was cleared and replaced with the live node.
    assert_eq!(
        store.get_node_for_room("roomC").await.unwrap(),
        "nd-live"
    );

    router.stop().await;
}

#[tokio::test]
async fn test_join_fails_when_every_node_is_dead() {
    let store = Arc::new(LocalStore::new(Duration::from_secs(10)));
    store.register_node(stale_node("nd-dead", 120)).await.unwrap();
    store.set_node_for_room("roomC", "nd-dead").await.unwrap();

    let config = test_config("nd-local");
    let selector = Box::new(RandomSelector::with_seed(config.expire_after, 3));
    let router = LocalRouter::with_store(config, selector, Arc::clone(&store));
    router.on_new_participant(Arc::new(|_, _, _, _| {}));
    router.on_rtc_message(Arc::new(|_, _, _| {}));
    // Never started: the local node is not registered, so no live node
    // exists anywhere in the catalog.

    let err = router
        .start_participant_signal("roomC", ParticipantInit::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Unavailable(_)));
}

#[tokio::test]
async fn test_binding_to_vanished_node_is_recovered() {
    let store = Arc::new(LocalStore::new(Duration::from_secs(10)));
    // The binding survived but the node record is gone entirely.
    store.set_node_for_room("roomC", "nd-vanished").await.unwrap();

    let router = router_over(Arc::clone(&store), "nd-live");
    router.start().await.unwrap();

    router
        .start_participant_signal(
            "roomC",
            ParticipantInit {
                identity: "carol".to_string(),
                ..ParticipantInit::default()
            },
        )
        .await
        .expect("join must recover from a dangling binding");
    assert_eq!(store.get_node_for_room("roomC").await.unwrap(), "nd-live");

    router.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_evictor_loop_removes_stale_records() {
    let store = Arc::new(LocalStore::new(Duration::from_secs(10)));
    store.register_node(stale_node("nd-stale", 120)).await.unwrap();

    let router = router_over(Arc::clone(&store), "nd-live");
    router.start().await.unwrap();

    // Let the evictor tick a few times.
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
    }

    let nodes = store.list_nodes().await.unwrap();
    assert_eq!(nodes.len(), 1, "only the heartbeating node should remain");
    assert_eq!(nodes[0].id, "nd-live");

    router.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_keeps_record_fresh() {
    let store = Arc::new(LocalStore::new(Duration::from_secs(10)));
    let router = router_over(Arc::clone(&store), "nd-live");
    router.start().await.unwrap();

    let first = store.get_node("nd-live").await.unwrap();
    let first_updated = first.stats.unwrap().updated_at;

    for _ in 0..4 {
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
    }

    let refreshed = store.get_node("nd-live").await.unwrap();
    // Paused tokio time does not move the wall clock, so equality is all a
    // fast test can assert; the record must still exist and parse.
    assert!(refreshed.stats.unwrap().updated_at >= first_updated);

    router.stop().await;
}

#[tokio::test]
async fn test_two_routers_race_for_one_room() {
    // Two local routers sharing one store model two façade instances racing
    // on the directory. Exactly one binding must win, and both observe it.
    let store = Arc::new(LocalStore::new(Duration::from_secs(10)));
    let router_a = router_over(Arc::clone(&store), "nd-a");
    let router_b = router_over(Arc::clone(&store), "nd-b");
    router_a.start().await.unwrap();
    router_b.start().await.unwrap();

    let set_a = router_a.set_node_for_room("roomR", "nd-a");
    let set_b = router_b.set_node_for_room("roomR", "nd-b");
    let (bound_a, bound_b) = tokio::join!(set_a, set_b);
    let bound_a = bound_a.unwrap();
    let bound_b = bound_b.unwrap();

    assert_eq!(bound_a, bound_b, "both callers must observe the same owner");
    assert!(bound_a == "nd-a" || bound_a == "nd-b");
    assert_eq!(
        store.get_node_for_room("roomR").await.unwrap(),
        bound_a
    );

    router_a.stop().await;
    router_b.stop().await;
}
