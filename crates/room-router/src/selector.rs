//! Node selection strategy for new room placement.
//!
//! The selector is pluggable: CPU-weighted or region-affine strategies can
//! replace the default without touching any caller. The default picks
//! uniformly at random over nodes with a fresh heartbeat.

use crate::errors::RouterError;
use crate::node::is_node_alive;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use router_proto::internal::Node;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Chooses the RTC-owning node for a new room.
pub trait NodeSelector: Send + Sync {
    /// Pick one node from the candidate list.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Unavailable`] when no usable node remains.
    fn select_node(&self, nodes: &[Node], room_name: &str) -> Result<Node, RouterError>;
}

/// Uniformly random pick over nodes whose heartbeat is fresh.
///
/// Candidates are sorted by id before the draw, so a fixed seed produces a
/// deterministic choice regardless of input order.
pub struct RandomSelector {
    expire_after: Duration,
    rng: Mutex<StdRng>,
}

impl RandomSelector {
    #[must_use]
    pub fn new(expire_after: Duration) -> Self {
        Self {
            expire_after,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Selector with a fixed RNG seed, for tests.
    #[must_use]
    pub fn with_seed(expire_after: Duration, seed: u64) -> Self {
        Self {
            expire_after,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl NodeSelector for RandomSelector {
    fn select_node(&self, nodes: &[Node], _room_name: &str) -> Result<Node, RouterError> {
        let mut candidates: Vec<&Node> = nodes
            .iter()
            .filter(|node| is_node_alive(node, self.expire_after))
            .collect();

        if candidates.is_empty() {
            return Err(RouterError::Unavailable(
                "no available nodes".to_string(),
            ));
        }

        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let index = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            rng.gen_range(0..candidates.len())
        };
        Ok(candidates[index].clone())
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

    #[test]
    fn test_select_from_empty_list_fails() {
        let selector = RandomSelector::new(Duration::from_secs(10));
        let err = selector.select_node(&[], "roomA").unwrap_err();
        assert!(matches!(err, RouterError::Unavailable(_)));
    }

    #[test]
    fn test_stale_nodes_are_filtered() {
        let selector = RandomSelector::new(Duration::from_secs(10));
        let nodes = vec![node("nd-stale", 60), node("nd-fresh", 1)];

        let picked = selector.select_node(&nodes, "roomA").unwrap();
        assert_eq!(picked.id, "nd-fresh");
    }

    #[test]
    fn test_all_stale_fails() {
        let selector = RandomSelector::new(Duration::from_secs(10));
        let nodes = vec![node("nd-1", 60), node("nd-2", 90)];

        let err = selector.select_node(&nodes, "roomA").unwrap_err();
        assert!(matches!(err, RouterError::Unavailable(_)));
    }

    #[test]
    fn test_fixed_seed_is_deterministic_across_input_order() {
        let nodes = vec![node("nd-a", 1), node("nd-b", 1), node("nd-c", 1)];
        let mut reversed = nodes.clone();
        reversed.reverse();

        let first = RandomSelector::with_seed(Duration::from_secs(10), 7)
            .select_node(&nodes, "roomA")
            .unwrap();
        let second = RandomSelector::with_seed(Duration::from_secs(10), 7)
            .select_node(&reversed, "roomA")
            .unwrap();

        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_spreads_over_candidates() {
        let selector = RandomSelector::with_seed(Duration::from_secs(10), 42);
        let nodes = vec![node("nd-a", 1), node("nd-b", 1), node("nd-c", 1)];

        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            seen.insert(selector.select_node(&nodes, "roomA").unwrap().id);
        }
        assert!(seen.len() > 1, "expected more than one node to be picked");
    }
}
