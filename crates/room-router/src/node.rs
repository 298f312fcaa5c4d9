//! Local node identity and load stats.
//!
//! Every process owns one [`LocalNode`]. Its counters track owned rooms and
//! live RTC-side pipes; each heartbeat folds a snapshot into the registry
//! record. Track counts are advisory fields updated by the upper layer at
//! whatever cadence it chooses.

use crate::config::RouterConfig;
use router_proto::internal::{Node, NodeStats};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use sysinfo::System;

/// State for the node this process represents.
pub struct LocalNode {
    id: String,
    ip: String,
    num_cpus: u32,
    started_at: i64,
    num_rooms: AtomicU32,
    num_clients: AtomicU32,
    num_tracks_in: AtomicU32,
    num_tracks_out: AtomicU32,
}

impl LocalNode {
    /// Create the local node record from configuration.
    ///
    /// The CPU count is sampled once at startup; the kernel does not grow
    /// cores under us.
    #[must_use]
    pub fn new(config: &RouterConfig) -> Self {
        let sys = System::new_all();
        let num_cpus = u32::try_from(sys.cpus().len()).unwrap_or(u32::MAX);

        Self {
            id: config.node_id.clone(),
            ip: config.node_ip.clone(),
            num_cpus,
            started_at: chrono::Utc::now().timestamp(),
            num_rooms: AtomicU32::new(0),
            num_clients: AtomicU32::new(0),
            num_tracks_in: AtomicU32::new(0),
            num_tracks_out: AtomicU32::new(0),
        }
    }

    /// This node's identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot the current record for a heartbeat write.
    ///
    /// `updated_at` is stamped with the current time; the persisted record is
    /// the authoritative heartbeat.
    #[must_use]
    pub fn snapshot(&self) -> Node {
        Node {
            id: self.id.clone(),
            ip: self.ip.clone(),
            num_cpus: self.num_cpus,
            stats: Some(NodeStats {
                started_at: self.started_at,
                updated_at: chrono::Utc::now().timestamp(),
                num_rooms: self.num_rooms.load(Ordering::Relaxed),
                num_clients: self.num_clients.load(Ordering::Relaxed),
                num_tracks_in: self.num_tracks_in.load(Ordering::Relaxed),
                num_tracks_out: self.num_tracks_out.load(Ordering::Relaxed),
            }),
        }
    }

    pub fn room_added(&self) {
        self.num_rooms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn room_removed(&self) {
        decrement_saturating(&self.num_rooms);
    }

    pub fn client_added(&self) {
        self.num_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_removed(&self) {
        decrement_saturating(&self.num_clients);
    }

    /// Advisory track counts; folded into the next heartbeat.
    pub fn set_track_stats(&self, num_tracks_in: u32, num_tracks_out: u32) {
        self.num_tracks_in.store(num_tracks_in, Ordering::Relaxed);
        self.num_tracks_out.store(num_tracks_out, Ordering::Relaxed);
    }
}

fn decrement_saturating(counter: &AtomicU32) {
    let mut current = counter.load(Ordering::Relaxed);
    while current > 0 {
        match counter.compare_exchange_weak(
            current,
            current - 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

/// Whether a node record is fresh enough to be considered live.
///
/// Liveness is judged solely by `now - stats.updated_at`; records without
/// stats are never live.
#[must_use]
pub fn is_node_alive(node: &Node, expire_after: Duration) -> bool {
    let Some(stats) = &node.stats else {
        return false;
    };
    // Negative age means the writer's clock is ahead of ours; still live.
    let age = chrono::Utc::now().timestamp() - stats.updated_at;
    age <= i64::try_from(expire_after.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn test_node() -> LocalNode {
        let config = RouterConfig {
            node_id: "nd-test-001".to_string(),
            ..RouterConfig::default()
        };
        LocalNode::new(&config)
    }

    #[test]
    fn test_snapshot_carries_identity() {
        let node = test_node();
        let snapshot = node.snapshot();

        assert_eq!(snapshot.id, "nd-test-001");
        assert_eq!(snapshot.ip, "127.0.0.1");
        assert!(snapshot.num_cpus > 0);
    }

    #[test]
    fn test_snapshot_stamps_updated_at() {
        let node = test_node();
        let now = chrono::Utc::now().timestamp();
        let stats = node.snapshot().stats.unwrap();

        assert!(stats.updated_at >= now - 1);
        assert!(stats.started_at <= stats.updated_at);
    }

    #[test]
    fn test_counters_fold_into_snapshot() {
        let node = test_node();
        node.room_added();
        node.client_added();
        node.client_added();
        node.set_track_stats(3, 12);

        let stats = node.snapshot().stats.unwrap();
        assert_eq!(stats.num_rooms, 1);
        assert_eq!(stats.num_clients, 2);
        assert_eq!(stats.num_tracks_in, 3);
        assert_eq!(stats.num_tracks_out, 12);

        node.client_removed();
        node.room_removed();
        let stats = node.snapshot().stats.unwrap();
        assert_eq!(stats.num_rooms, 0);
        assert_eq!(stats.num_clients, 1);
    }

    #[test]
    fn test_counters_never_underflow() {
        let node = test_node();
        node.client_removed();
        node.room_removed();

        let stats = node.snapshot().stats.unwrap();
        assert_eq!(stats.num_rooms, 0);
        assert_eq!(stats.num_clients, 0);
    }

    #[test]
    fn test_fresh_node_is_alive() {
        let node = test_node().snapshot();
        assert!(is_node_alive(&node, Duration::from_secs(10)));
    }

    #[test]
    fn test_stale_node_is_dead() {
        let mut node = test_node().snapshot();
        let stats = node.stats.as_mut().unwrap();
        stats.updated_at = chrono::Utc::now().timestamp() - 60;

        assert!(!is_node_alive(&node, Duration::from_secs(10)));
    }

    #[test]
    fn test_node_without_stats_is_dead() {
        let mut node = test_node().snapshot();
        node.stats = None;

        assert!(!is_node_alive(&node, Duration::from_secs(10)));
    }
}
