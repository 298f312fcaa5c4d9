//! The router façade: the contract every realization satisfies.
//!
//! A router coordinates the node registry, the room directory, the node
//! selector, the session pipes, and the RTC control channel behind one
//! object. Two realizations exist: [`crate::local::LocalRouter`] for a
//! single process and [`crate::redis::RedisRouter`] for a fleet sharing a
//! Redis fabric.

use crate::channel::{MessageSink, MessageSource};
use crate::config::RouterConfig;
use crate::errors::RouterError;
use crate::node::is_node_alive;
use crate::selector::NodeSelector;
use crate::store::{NodeRegistry, RoomDirectory};
use async_trait::async_trait;
use router_proto::internal::{
    rtc_node_message, Node, ParticipantPermission, RtcNodeMessage, SignalRequest, SignalResponse,
    StartSession,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

/// Initial state for a joining participant, forwarded to the RTC side in
/// `StartSession`.
#[derive(Debug, Clone, Default)]
pub struct ParticipantInit {
    /// Unique within the room; forms the participant key together with the
    /// room name.
    pub identity: String,
    /// Opaque metadata passed through to the media session.
    pub metadata: String,
    /// Whether the client is reconnecting (resume instead of restart).
    pub reconnect: bool,
    pub permission: Option<ParticipantPermission>,
    pub protocol_version: i32,
    pub auto_subscribe: bool,
    pub hidden: bool,
}

impl ParticipantInit {
    pub(crate) fn into_start_session(self, room_name: &str, connection_id: &str) -> StartSession {
        StartSession {
            room_name: room_name.to_string(),
            identity: self.identity,
            connection_id: connection_id.to_string(),
            reconnect: self.reconnect,
            metadata: self.metadata,
            permission: self.permission,
            protocol_version: self.protocol_version,
            auto_subscribe: self.auto_subscribe,
            hidden: self.hidden,
        }
    }

    pub(crate) fn from_start_session(session: &StartSession) -> Self {
        Self {
            identity: session.identity.clone(),
            metadata: session.metadata.clone(),
            reconnect: session.reconnect,
            permission: session.permission,
            protocol_version: session.protocol_version,
            auto_subscribe: session.auto_subscribe,
            hidden: session.hidden,
        }
    }
}

/// The signal-node half of a freshly established session pipe.
pub struct SignalConnection {
    /// Globally unique id for this connection; names the signal-side subject
    /// in the distributed realization.
    pub connection_id: String,
    /// Requests written here surface at the RTC side's request source.
    pub request_sink: Arc<dyn MessageSink<SignalRequest>>,
    /// Responses written by the RTC side surface here, in FIFO order.
    pub response_source: MessageSource<SignalResponse>,
}

impl std::fmt::Debug for SignalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalConnection")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// Invoked on the RTC owner when a participant's session pipe is
/// established. Handlers must not block the invoking task; move work onto
/// your own task.
pub type NewParticipantCallback = Arc<
    dyn Fn(String, ParticipantInit, MessageSource<SignalRequest>, Arc<dyn MessageSink<SignalResponse>>)
        + Send
        + Sync,
>;

/// Invoked on the RTC owner for room-addressed control messages
/// (remove / mute / update). Same non-blocking rule as
/// [`NewParticipantCallback`].
pub type RtcMessageCallback = Arc<dyn Fn(String, String, RtcNodeMessage) + Send + Sync>;

/// Coordinates participant sessions across the fleet.
#[async_trait]
pub trait Router: Send + Sync {
    /// The id of the node this router represents.
    fn local_node_id(&self) -> &str;

    /// Persist this node's record immediately (also done by `start`, which
    /// then refreshes it on the heartbeat interval).
    async fn register_node(&self) -> Result<(), RouterError>;

    /// Remove this node's record.
    async fn unregister_node(&self) -> Result<(), RouterError>;

    async fn get_node(&self, node_id: &str) -> Result<Node, RouterError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, RouterError>;

    /// Evict registry records with an expired heartbeat. Returns how many
    /// were removed.
    async fn remove_dead_nodes(&self) -> Result<usize, RouterError>;

    /// The node currently bound to a room. Fails with the distinct
    /// not-found kind when the room is unassigned.
    async fn get_node_for_room(&self, room_name: &str) -> Result<Node, RouterError>;

    /// Set-if-absent room assignment; returns the id bound after the call.
    /// Binding a room to this node starts its room subscription.
    async fn set_node_for_room(
        &self,
        room_name: &str,
        node_id: &str,
    ) -> Result<String, RouterError>;

    /// Drop a room's assignment. Idempotent.
    async fn clear_room_state(&self, room_name: &str) -> Result<(), RouterError>;

    /// Establish the signal-node half of a session pipe for a participant
    /// whose control connection is ready.
    async fn start_participant_signal(
        &self,
        room_name: &str,
        init: ParticipantInit,
    ) -> Result<SignalConnection, RouterError>;

    /// Deliver a control message to the room's RTC owner. At-most-once: if
    /// the owner just died the message is lost, and the caller re-issues
    /// through idempotent higher-level operations.
    async fn write_rtc_message(
        &self,
        room_name: &str,
        identity: &str,
        message: rtc_node_message::Message,
    ) -> Result<(), RouterError>;

    /// Update the advisory track counts folded into the next heartbeat.
    /// The upper layer owns the cadence.
    fn set_track_stats(&self, num_tracks_in: u32, num_tracks_out: u32);

    /// Register the new-participant handler. At most one; re-registration
    /// replaces. Must be registered before `start`.
    fn on_new_participant(&self, callback: NewParticipantCallback);

    /// Register the control-message handler. At most one; re-registration
    /// replaces. Must be registered before `start`.
    fn on_rtc_message(&self, callback: RtcMessageCallback);

    /// Register this node and start the background loops (heartbeat,
    /// dead-node evictor, message dispatch).
    async fn start(&self) -> Result<(), RouterError>;

    /// Stop loops, unregister best-effort, drain pipes within the grace
    /// window, then force-close whatever remains.
    async fn stop(&self);
}

/// Create a router for the configured mode: distributed when a Redis URL is
/// present, single-process otherwise.
pub async fn create_router(
    config: RouterConfig,
    selector: Box<dyn NodeSelector>,
) -> Result<Arc<dyn Router>, RouterError> {
    if config.redis_url.is_some() {
        info!(target: "router", node_id = %config.node_id, "using distributed routing");
        Ok(Arc::new(
            crate::redis::RedisRouter::connect(config, selector).await?,
        ))
    } else {
        info!(target: "router", node_id = %config.node_id, "using single-process routing");
        Ok(Arc::new(crate::local::LocalRouter::new(config, selector)))
    }
}

/// Handler registration shared by both realizations.
pub(crate) struct CallbackRegistry {
    new_participant: Mutex<Option<NewParticipantCallback>>,
    rtc_message: Mutex<Option<RtcMessageCallback>>,
}

impl CallbackRegistry {
    pub(crate) fn new() -> Self {
        Self {
            new_participant: Mutex::new(None),
            rtc_message: Mutex::new(None),
        }
    }

    pub(crate) fn set_new_participant(&self, callback: NewParticipantCallback) {
        *self
            .new_participant
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub(crate) fn set_rtc_message(&self, callback: RtcMessageCallback) {
        *self
            .rtc_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub(crate) fn new_participant(&self) -> Option<NewParticipantCallback> {
        self.new_participant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn rtc_message(&self) -> Option<RtcMessageCallback> {
        self.rtc_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Both handlers must exist before `start`, otherwise messages arriving
    /// between subscribe and handler registration would be lost.
    pub(crate) fn require_registered(&self) -> Result<(), RouterError> {
        if self.new_participant().is_none() {
            return Err(RouterError::Protocol(
                "new-participant handler must be registered before start".to_string(),
            ));
        }
        if self.rtc_message().is_none() {
            return Err(RouterError::Protocol(
                "rtc-message handler must be registered before start".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve the RTC owner for a room, assigning one when the room is new.
///
/// Lookup, then select-and-set-if-absent on a miss; whichever assignment won
/// a race is accepted. The bound node must have a fresh heartbeat; a stale
/// binding is cleared and the whole sequence retried once. A second failure
/// means no node is available.
pub(crate) async fn resolve_room_node<S>(
    store: &S,
    selector: &dyn NodeSelector,
    room_name: &str,
    expire_after: Duration,
) -> Result<Node, RouterError>
where
    S: NodeRegistry + RoomDirectory + ?Sized,
{
    for _attempt in 0..2 {
        let node_id = match store.get_node_for_room(room_name).await {
            Ok(node_id) => node_id,
            Err(err) if err.is_not_found() => {
                let nodes = store.list_nodes().await?;
                let candidate = selector.select_node(&nodes, room_name)?;
                store.set_node_for_room(room_name, &candidate.id).await?
            }
            Err(err) => return Err(err),
        };

        match store.get_node(&node_id).await {
            Ok(node) if is_node_alive(&node, expire_after) => return Ok(node),
            Ok(_) | Err(RouterError::NotFound(_)) => {
                info!(
                    target: "router",
                    room_name = %room_name,
                    node_id = %node_id,
                    "room bound to dead node, clearing assignment"
                );
                store.clear_room_state(room_name).await?;
            }
            Err(err) => return Err(err),
        }
    }

    Err(RouterError::Unavailable(format!(
        "no available node for room {room_name}"
    )))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::selector::RandomSelector;
    use crate::store::LocalStore;
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

    const EXPIRE: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_resolve_assigns_new_room_to_live_node() {
        let store = LocalStore::new(EXPIRE);
        store.register_node(node("nd-1", 0)).await.unwrap();
        let selector = RandomSelector::with_seed(EXPIRE, 1);

        let owner = resolve_room_node(&store, &selector, "roomA", EXPIRE)
            .await
            .unwrap();

        assert_eq!(owner.id, "nd-1");
        assert_eq!(store.get_node_for_room("roomA").await.unwrap(), "nd-1");
    }

    #[tokio::test]
    async fn test_resolve_returns_existing_assignment() {
        let store = LocalStore::new(EXPIRE);
        store.register_node(node("nd-1", 0)).await.unwrap();
        store.register_node(node("nd-2", 0)).await.unwrap();
        store.set_node_for_room("roomA", "nd-2").await.unwrap();
        let selector = RandomSelector::with_seed(EXPIRE, 1);

        let owner = resolve_room_node(&store, &selector, "roomA", EXPIRE)
            .await
            .unwrap();

        assert_eq!(owner.id, "nd-2");
    }

    #[tokio::test]
    async fn test_resolve_clears_stale_binding_and_reassigns() {
        let store = LocalStore::new(EXPIRE);
        store.register_node(node("nd-dead", 60)).await.unwrap();
        store.register_node(node("nd-live", 0)).await.unwrap();
        store.set_node_for_room("roomC", "nd-dead").await.unwrap();
        let selector = RandomSelector::with_seed(EXPIRE, 1);

        let owner = resolve_room_node(&store, &selector, "roomC", EXPIRE)
            .await
            .unwrap();

        assert_eq!(owner.id, "nd-live");
        assert_eq!(store.get_node_for_room("roomC").await.unwrap(), "nd-live");
    }

    #[tokio::test]
    async fn test_resolve_handles_binding_to_unknown_node() {
        let store = LocalStore::new(EXPIRE);
        store.register_node(node("nd-live", 0)).await.unwrap();
        store
            .set_node_for_room("roomC", "nd-vanished")
            .await
            .unwrap();
        let selector = RandomSelector::with_seed(EXPIRE, 1);

        let owner = resolve_room_node(&store, &selector, "roomC", EXPIRE)
            .await
            .unwrap();

        assert_eq!(owner.id, "nd-live");
    }

    #[tokio::test]
    async fn test_resolve_fails_when_no_live_node_exists() {
        let store = LocalStore::new(EXPIRE);
        store.register_node(node("nd-dead", 60)).await.unwrap();
        store.set_node_for_room("roomC", "nd-dead").await.unwrap();
        let selector = RandomSelector::with_seed(EXPIRE, 1);

        let err = resolve_room_node(&store, &selector, "roomC", EXPIRE)
            .await
            .unwrap_err();

        assert!(matches!(err, RouterError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_callback_registry_requires_both_handlers() {
        let registry = CallbackRegistry::new();
        assert!(registry.require_registered().is_err());

        registry.set_new_participant(Arc::new(|_, _, _, _| {}));
        assert!(registry.require_registered().is_err());

        registry.set_rtc_message(Arc::new(|_, _, _| {}));
        assert!(registry.require_registered().is_ok());
    }

    #[test]
    fn test_participant_init_round_trips_through_start_session() {
        let init = ParticipantInit {
            identity: "alice".to_string(),
            metadata: "meta".to_string(),
            reconnect: true,
            permission: Some(ParticipantPermission {
                can_subscribe: true,
                can_publish: false,
                can_publish_data: true,
            }),
            protocol_version: 3,
            auto_subscribe: false,
            hidden: true,
        };

        let session = init.clone().into_start_session("roomA", "cn-1");
        assert_eq!(session.room_name, "roomA");
        assert_eq!(session.connection_id, "cn-1");

        let restored = ParticipantInit::from_start_session(&session);
        assert_eq!(restored.identity, init.identity);
        assert_eq!(restored.metadata, init.metadata);
        assert_eq!(restored.reconnect, init.reconnect);
        assert_eq!(restored.permission, init.permission);
        assert_eq!(restored.protocol_version, init.protocol_version);
        assert_eq!(restored.auto_subscribe, init.auto_subscribe);
        assert_eq!(restored.hidden, init.hidden);
    }
}
