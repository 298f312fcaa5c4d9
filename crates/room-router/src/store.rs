//! Node registry and room directory contracts, plus the in-memory backing.
//!
//! The registry owns `Node` records; the directory owns room-to-node
//! assignments. The directory holds no liveness: it may point at an evicted
//! node, and callers must cross-check the registry.

use crate::errors::RouterError;
use async_trait::async_trait;
use router_proto::internal::Node;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Fleet membership catalog.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Persist (or refresh) a node record. The record is the authoritative
    /// heartbeat; liveness is judged by `stats.updated_at` age.
    async fn register_node(&self, node: Node) -> Result<(), RouterError>;

    /// Delete a node record.
    async fn unregister_node(&self, node_id: &str) -> Result<(), RouterError>;

    /// Fetch a node record by id.
    async fn get_node(&self, node_id: &str) -> Result<Node, RouterError>;

    /// Snapshot of all records. Ordering is unspecified; entries may be
    /// stale up to the expiry window.
    async fn list_nodes(&self) -> Result<Vec<Node>, RouterError>;

    /// Delete records whose heartbeat age exceeds the expiry window.
    /// Returns how many were removed.
    async fn remove_dead_nodes(&self) -> Result<usize, RouterError>;
}

/// Room-to-node assignment directory.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Current assignment for a room, or the distinct not-found kind.
    async fn get_node_for_room(&self, room_name: &str) -> Result<String, RouterError>;

    /// Set-if-absent assignment. Returns the node id bound to the room after
    /// the call: the argument when this caller won, the existing binding when
    /// it lost. Two racing callers therefore converge on the same owner.
    async fn set_node_for_room(
        &self,
        room_name: &str,
        node_id: &str,
    ) -> Result<String, RouterError>;

    /// Remove a room's assignment. Idempotent.
    async fn clear_room_state(&self, room_name: &str) -> Result<(), RouterError>;
}

/// In-memory registry + directory for single-process routing.
///
/// Also serves tests that need to stage fleet states (stale heartbeats,
/// pre-existing assignments) without a backing store.
pub struct LocalStore {
    nodes: RwLock<HashMap<String, Node>>,
    rooms: RwLock<HashMap<String, String>>,
    expire_after: Duration,
}

impl LocalStore {
    #[must_use]
    pub fn new(expire_after: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            expire_after,
        }
    }
}

#[async_trait]
impl NodeRegistry for LocalStore {
    async fn register_node(&self, node: Node) -> Result<(), RouterError> {
        self.nodes.write().await.insert(node.id.clone(), node);
        Ok(())
    }

    async fn unregister_node(&self, node_id: &str) -> Result<(), RouterError> {
        self.nodes.write().await.remove(node_id);
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Node, RouterError> {
        self.nodes
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| RouterError::NotFound(format!("node {node_id}")))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, RouterError> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn remove_dead_nodes(&self) -> Result<usize, RouterError> {
        let expire = i64::try_from(self.expire_after.as_secs()).unwrap_or(i64::MAX);
        let now = chrono::Utc::now().timestamp();

        let mut nodes = self.nodes.write().await;
        let before = nodes.len();
        nodes.retain(|node_id, node| {
            let alive = node
                .stats
                .as_ref()
                .is_some_and(|stats| now - stats.updated_at <= expire);
            if !alive {
                debug!(target: "router.store", node_id = %node_id, "evicting dead node");
            }
            alive
        });
        Ok(before - nodes.len())
    }
}

#[async_trait]
impl RoomDirectory for LocalStore {
    async fn get_node_for_room(&self, room_name: &str) -> Result<String, RouterError> {
        self.rooms
            .read()
            .await
            .get(room_name)
            .cloned()
            .ok_or_else(|| RouterError::NotFound(format!("room {room_name}")))
    }

    async fn set_node_for_room(
        &self,
        room_name: &str,
        node_id: &str,
    ) -> Result<String, RouterError> {
        let mut rooms = self.rooms.write().await;
        let bound = rooms
            .entry(room_name.to_string())
            .or_insert_with(|| node_id.to_string());
        Ok(bound.clone())
    }

    async fn clear_room_state(&self, room_name: &str) -> Result<(), RouterError> {
        self.rooms.write().await.remove(room_name);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use router_proto::internal::NodeStats;

    fn node(id: &str, age_seconds: i64) -> Node {
        let now = chrono::Utc::now().timestamp();
        Node {
            id: id.to_string(),
            ip: "127.0.0.1".to_string(),
            num_cpus: 4,
            stats: Some(NodeStats {
                started_at: now - 3600,
                updated_at: now - age_seconds,
                ..NodeStats::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_register_and_get_node() {
        let store = LocalStore::new(Duration::from_secs(10));
        store.register_node(node("nd-1", 0)).await.unwrap();

        let fetched = store.get_node("nd-1").await.unwrap();
        assert_eq!(fetched.id, "nd-1");

        let err = store.get_node("nd-missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_register_refreshes_existing_record() {
        let store = LocalStore::new(Duration::from_secs(10));
        store.register_node(node("nd-1", 60)).await.unwrap();
        store.register_node(node("nd-1", 0)).await.unwrap();

        let nodes = store.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);

        let removed = store.remove_dead_nodes().await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_remove_dead_nodes_evicts_stale_records() {
        let store = LocalStore::new(Duration::from_secs(10));
        store.register_node(node("nd-fresh", 1)).await.unwrap();
        store.register_node(node("nd-stale", 60)).await.unwrap();

        let mut no_stats = node("nd-no-stats", 0);
        no_stats.stats = None;
        store.register_node(no_stats).await.unwrap();

        let removed = store.remove_dead_nodes().await.unwrap();
        assert_eq!(removed, 2);

        let remaining = store.list_nodes().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "nd-fresh");
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let store = LocalStore::new(Duration::from_secs(10));
        store.register_node(node("nd-1", 0)).await.unwrap();

        store.unregister_node("nd-1").await.unwrap();
        store.unregister_node("nd-1").await.unwrap();

        assert!(store.list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_node_for_room_is_first_writer_wins() {
        let store = LocalStore::new(Duration::from_secs(10));

        let first = store.set_node_for_room("roomA", "nd-1").await.unwrap();
        let second = store.set_node_for_room("roomA", "nd-2").await.unwrap();

        assert_eq!(first, "nd-1");
        assert_eq!(second, "nd-1");
        assert_eq!(store.get_node_for_room("roomA").await.unwrap(), "nd-1");
    }

    #[tokio::test]
    async fn test_concurrent_assignment_converges() {
        let store = std::sync::Arc::new(LocalStore::new(Duration::from_secs(10)));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .set_node_for_room("roomB", &format!("nd-{i}"))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = std::collections::HashSet::new();
        for handle in handles {
            winners.insert(handle.await.unwrap());
        }
        assert_eq!(winners.len(), 1, "all callers must observe the same owner");
    }

    #[tokio::test]
    async fn test_clear_room_state_is_idempotent() {
        let store = LocalStore::new(Duration::from_secs(10));
        store.set_node_for_room("roomA", "nd-1").await.unwrap();

        store.clear_room_state("roomA").await.unwrap();
        store.clear_room_state("roomA").await.unwrap();

        let err = store.get_node_for_room("roomA").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_node_for_room_distinct_not_found() {
        let store = LocalStore::new(Duration::from_secs(10));
        let err = store.get_node_for_room("never-set").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
