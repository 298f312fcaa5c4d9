//! Distributed realization of the router over the Redis fabric.
//!
//! Requests travel S→R on `rtc.{room}`; responses and the `EndSession`
//! marker travel R→S on `signal.{connection_id}`. The room's owner holds the
//! single subscription to its room subject and demultiplexes by participant
//! key. Each subscription runs on its own pub/sub connection owned by one
//! reader task, so dropping the task releases the subscription with it.

use crate::channel::{message_channel, spawn_close_link, ChannelSink, CloseOnDrop, MessageSink};
use crate::config::RouterConfig;
use crate::errors::RouterError;
use crate::node::LocalNode;
use crate::observability::{self, Direction};
use crate::redis::keys;
use crate::redis::sink::FabricSink;
use crate::redis::store::RedisStore;
use crate::router::{
    resolve_room_node, CallbackRegistry, NewParticipantCallback, ParticipantInit, Router,
    RtcMessageCallback, SignalConnection,
};
use crate::secret::ExposeSecret;
use crate::selector::NodeSelector;
use crate::store::{NodeRegistry, RoomDirectory};
use async_trait::async_trait;
use futures_util::StreamExt;
use prost::Message as _;
use redis::aio::MultiplexedConnection;
use router_proto::internal::{
    rtc_node_message, signal_node_message, EndSession, Node, RtcNodeMessage, SignalNodeMessage,
    SignalRequest, SignalResponse, StartSession,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

struct RoomSubscription {
    cancel: CancellationToken,
    /// Identity marker; the reader task only deregisters its own entry.
    marker: Arc<()>,
}

/// RTC-side state for one participant's session pipe.
struct RtcPipe {
    room_name: String,
    request_feed: Arc<ChannelSink<SignalRequest>>,
    response_sink: Arc<FabricSink<SignalResponse>>,
    /// Unix seconds of the last request (or the `StartSession`).
    last_activity: Arc<AtomicI64>,
}

/// Signal-side state for one participant's session pipe.
struct SignalPipe {
    request_sink: Arc<FabricSink<SignalRequest>>,
    response_feed: Arc<ChannelSink<SignalResponse>>,
}

struct RedisRouterInner {
    config: RouterConfig,
    node: LocalNode,
    store: RedisStore,
    client: redis::Client,
    connection: MultiplexedConnection,
    selector: Box<dyn NodeSelector>,
    callbacks: CallbackRegistry,
    room_subscriptions: Mutex<HashMap<String, RoomSubscription>>,
    rtc_pipes: Mutex<HashMap<String, RtcPipe>>,
    signal_pipes: Mutex<HashMap<String, SignalPipe>>,
    cancel: CancellationToken,
    loops_cancel: CancellationToken,
    started: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Router for a node participating in a Redis-coordinated fleet.
pub struct RedisRouter {
    inner: Arc<RedisRouterInner>,
}

impl RedisRouter {
    /// Connect to the fabric and build the router. Fails with `Unavailable`
    /// when no Redis URL is configured or the fabric is unreachable.
    pub async fn connect(
        config: RouterConfig,
        selector: Box<dyn NodeSelector>,
    ) -> Result<Self, RouterError> {
        let url = config.redis_url.clone().ok_or_else(|| {
            RouterError::Unavailable("no redis url configured".to_string())
        })?;

        // The URL may carry credentials; never include it in errors or logs.
        let client = redis::Client::open(url.expose_secret()).map_err(|err| {
            RouterError::Unavailable(format!("failed to open redis client: {err}"))
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| {
                RouterError::Unavailable(format!("failed to connect to redis: {err}"))
            })?;

        let store = RedisStore::new(
            connection.clone(),
            config.expire_after,
            config.operation_timeout,
        );
        let node = LocalNode::new(&config);
        let cancel = CancellationToken::new();
        let loops_cancel = cancel.child_token();

        Ok(Self {
            inner: Arc::new(RedisRouterInner {
                config,
                node,
                store,
                client,
                connection,
                selector,
                callbacks: CallbackRegistry::new(),
                room_subscriptions: Mutex::new(HashMap::new()),
                rtc_pipes: Mutex::new(HashMap::new()),
                signal_pipes: Mutex::new(HashMap::new()),
                cancel,
                loops_cancel,
                started: AtomicBool::new(false),
                tasks: StdMutex::new(Vec::new()),
            }),
        })
    }
}

impl RedisRouterInner {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), RouterError> {
        let mut conn = self.connection.clone();
        let publish = async {
            let result: redis::RedisResult<()> =
                redis::AsyncCommands::publish(&mut conn, subject, payload).await;
            result
        };
        match tokio::time::timeout(self.config.operation_timeout, publish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(RouterError::Canceled(
                "publish deadline exceeded".to_string(),
            )),
        }
    }

    /// Close pipes whose signal node went away without a trace: no request
    /// observed within the idle timeout.
    async fn sweep_idle_pipes(&self, room_name: &str) {
        let idle = i64::try_from(self.config.idle_timeout.as_secs()).unwrap_or(i64::MAX);
        let now = chrono::Utc::now().timestamp();

        let stale: Vec<(String, Arc<ChannelSink<SignalRequest>>, Arc<FabricSink<SignalResponse>>)> = {
            let pipes = self.rtc_pipes.lock().await;
            pipes
                .iter()
                .filter(|(_, pipe)| {
                    pipe.room_name == room_name
                        && now - pipe.last_activity.load(Ordering::Relaxed) > idle
                })
                .map(|(key, pipe)| {
                    (
                        key.clone(),
                        Arc::clone(&pipe.request_feed),
                        Arc::clone(&pipe.response_sink),
                    )
                })
                .collect()
        };

        for (key, request_feed, response_sink) in stale {
            info!(
                target: "router.redis",
                participant_key = %key,
                "closing idle session pipe"
            );
            request_feed.close_now();
            response_sink.close_now().await;
        }
    }

    /// Close every pipe belonging to a room; used when the room subscription
    /// ends.
    async fn close_room_pipes(&self, room_name: &str) {
        let pipes: Vec<(Arc<ChannelSink<SignalRequest>>, Arc<FabricSink<SignalResponse>>)> = {
            let guard = self.rtc_pipes.lock().await;
            guard
                .values()
                .filter(|pipe| pipe.room_name == room_name)
                .map(|pipe| {
                    (
                        Arc::clone(&pipe.request_feed),
                        Arc::clone(&pipe.response_sink),
                    )
                })
                .collect()
        };

        for (request_feed, response_sink) in pipes {
            request_feed.close_now();
            response_sink.close_now().await;
        }
    }
}

/// Subscribe to the room subject if this node is not already the active
/// consumer. Idempotent; called whenever the directory binds a room to this
/// node.
async fn ensure_room_subscription(
    inner: &Arc<RedisRouterInner>,
    room_name: &str,
) -> Result<(), RouterError> {
    let mut subscriptions = inner.room_subscriptions.lock().await;
    if let Some(existing) = subscriptions.get(room_name) {
        if !existing.cancel.is_cancelled() {
            return Ok(());
        }
        subscriptions.remove(room_name);
    }

    let subject = keys::rtc_subject(room_name);
    let subscribe = async {
        let mut pubsub = inner.client.get_async_pubsub().await?;
        pubsub.subscribe(&subject).await?;
        redis::RedisResult::Ok(pubsub)
    };
    let pubsub = match tokio::time::timeout(inner.config.operation_timeout, subscribe).await {
        Ok(Ok(pubsub)) => pubsub,
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => {
            return Err(RouterError::Canceled(
                "subscribe deadline exceeded".to_string(),
            ))
        }
    };

    let cancel = inner.cancel.child_token();
    let marker = Arc::new(());
    subscriptions.insert(
        room_name.to_string(),
        RoomSubscription {
            cancel: cancel.clone(),
            marker: Arc::clone(&marker),
        },
    );
    inner.node.room_added();
    drop(subscriptions);

    tokio::spawn(run_room_subscription(
        Arc::clone(inner),
        room_name.to_string(),
        pubsub,
        cancel,
        marker,
    ));

    info!(
        target: "router.redis",
        node_id = %inner.node.id(),
        room_name = %room_name,
        "subscribed to room subject"
    );
    Ok(())
}

async fn handle_rtc_payload(inner: &Arc<RedisRouterInner>, room_name: &str, payload: &[u8]) {
    let envelope = match RtcNodeMessage::decode(payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(
                target: "router.redis",
                room_name = %room_name,
                error = %err,
                "dropping undecodable rtc payload"
            );
            observability::record_protocol_error();
            return;
        }
    };
    let Some(kind) = envelope.message.clone() else {
        warn!(
            target: "router.redis",
            room_name = %room_name,
            "dropping rtc envelope without message"
        );
        observability::record_protocol_error();
        return;
    };
    observability::record_rtc_message(observability::rtc_message_kind(&kind));

    match kind {
        rtc_node_message::Message::StartSession(session) => {
            handle_start_session(inner, room_name, &envelope.participant_key, session).await;
        }
        rtc_node_message::Message::Request(request) => {
            let sink = {
                let pipes = inner.rtc_pipes.lock().await;
                pipes.get(&envelope.participant_key).map(|pipe| {
                    pipe.last_activity
                        .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
                    Arc::clone(&pipe.request_feed)
                })
            };
            match sink {
                Some(sink) => {
                    if let Err(err) = sink.write_message(request).await {
                        debug!(
                            target: "router.redis",
                            participant_key = %envelope.participant_key,
                            error = %err,
                            "request dropped on closed pipe"
                        );
                    }
                }
                None => {
                    warn!(
                        target: "router.redis",
                        participant_key = %envelope.participant_key,
                        "request for unknown session"
                    );
                    observability::record_protocol_error();
                }
            }
        }
        _ => match router_proto::split_participant_key(&envelope.participant_key) {
            Some((_, identity)) => {
                if let Some(callback) = inner.callbacks.rtc_message() {
                    callback(room_name.to_string(), identity.to_string(), envelope);
                }
            }
            None => {
                warn!(
                    target: "router.redis",
                    participant_key = %envelope.participant_key,
                    "control message with malformed participant key"
                );
                observability::record_protocol_error();
            }
        },
    }
}

async fn handle_start_session(
    inner: &Arc<RedisRouterInner>,
    room_name: &str,
    participant_key: &str,
    session: StartSession,
) {
    if session.connection_id.is_empty() {
        warn!(
            target: "router.redis",
            participant_key = %participant_key,
            "start session without connection id"
        );
        observability::record_protocol_error();
        return;
    }

    // A resumed connection replaces whatever pipe the key already has.
    let previous = inner.rtc_pipes.lock().await.remove(participant_key);
    if let Some(previous) = previous {
        debug!(
            target: "router.redis",
            participant_key = %participant_key,
            reconnect = session.reconnect,
            "replacing existing session pipe"
        );
        previous.request_feed.close_now();
        previous.response_sink.close_now().await;
        inner.node.client_removed();
    }

    let connection_id = session.connection_id.clone();
    let (request_feed, request_source) =
        message_channel::<SignalRequest>(inner.config.channel_capacity, Direction::Request);

    let end_marker = SignalNodeMessage {
        connection_id: connection_id.clone(),
        message: Some(signal_node_message::Message::EndSession(EndSession {})),
    }
    .encode_to_vec();
    let encode_connection_id = connection_id.clone();
    let response_sink = FabricSink::new(
        inner.connection.clone(),
        keys::signal_subject(&connection_id),
        inner.config.operation_timeout,
        Box::new(move |response: &SignalResponse| {
            SignalNodeMessage {
                connection_id: encode_connection_id.clone(),
                message: Some(signal_node_message::Message::Response(response.clone())),
            }
            .encode_to_vec()
        }),
        Some(end_marker),
    );

    let last_activity = Arc::new(AtomicI64::new(chrono::Utc::now().timestamp()));

    {
        let inner = Arc::clone(inner);
        let key = participant_key.to_string();
        let request_feed = Arc::clone(&request_feed);
        let response_sink = Arc::clone(&response_sink);
        spawn_close_link(
            request_feed.closed_token(),
            response_sink.closed_token(),
            async move {
                request_feed.close_now();
                response_sink.close_now().await;
                let mut pipes = inner.rtc_pipes.lock().await;
                let ours = pipes
                    .get(&key)
                    .is_some_and(|pipe| Arc::ptr_eq(&pipe.request_feed, &request_feed));
                if ours {
                    pipes.remove(&key);
                    inner.node.client_removed();
                    observability::set_rtc_pipes_active(pipes.len());
                }
            },
        );
    }

    {
        let mut pipes = inner.rtc_pipes.lock().await;
        pipes.insert(
            participant_key.to_string(),
            RtcPipe {
                room_name: room_name.to_string(),
                request_feed,
                response_sink: Arc::clone(&response_sink),
                last_activity,
            },
        );
        inner.node.client_added();
        observability::set_rtc_pipes_active(pipes.len());
    }

    let init = ParticipantInit::from_start_session(&session);
    if let Some(callback) = inner.callbacks.new_participant() {
        callback(
            session.room_name.clone(),
            init,
            request_source,
            response_sink as Arc<dyn MessageSink<SignalResponse>>,
        );
    }
}

async fn run_room_subscription(
    inner: Arc<RedisRouterInner>,
    room_name: String,
    mut pubsub: redis::aio::PubSub,
    cancel: CancellationToken,
    marker: Arc<()>,
) {
    let mut sweep = tokio::time::interval(inner.config.refresh_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    {
        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    inner.sweep_idle_pipes(&room_name).await;
                }
                message = stream.next() => {
                    let Some(message) = message else {
                        warn!(
                            target: "router.redis",
                            room_name = %room_name,
                            "room subscription lost"
                        );
                        break;
                    };
                    match message.get_payload::<Vec<u8>>() {
                        Ok(payload) => handle_rtc_payload(&inner, &room_name, &payload).await,
                        Err(err) => {
                            warn!(
                                target: "router.redis",
                                room_name = %room_name,
                                error = %err,
                                "unreadable rtc payload"
                            );
                            observability::record_protocol_error();
                        }
                    }
                }
            }
        }
    }

    inner.close_room_pipes(&room_name).await;
    {
        let mut subscriptions = inner.room_subscriptions.lock().await;
        let ours = subscriptions
            .get(&room_name)
            .is_some_and(|sub| Arc::ptr_eq(&sub.marker, &marker));
        if ours {
            subscriptions.remove(&room_name);
        }
    }
    inner.node.room_removed();
    debug!(
        target: "router.redis",
        room_name = %room_name,
        "room subscription stopped"
    );
}

async fn run_signal_subscription(
    connection_id: String,
    mut pubsub: redis::aio::PubSub,
    cancel: CancellationToken,
    response_feed: Arc<ChannelSink<SignalResponse>>,
) {
    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => {
                let Some(message) = message else {
                    warn!(
                        target: "router.redis",
                        connection_id = %connection_id,
                        "signal subscription lost"
                    );
                    response_feed.close_now();
                    break;
                };
                let payload: Vec<u8> = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(
                            target: "router.redis",
                            connection_id = %connection_id,
                            error = %err,
                            "unreadable signal payload"
                        );
                        observability::record_protocol_error();
                        continue;
                    }
                };
                let envelope = match SignalNodeMessage::decode(payload.as_slice()) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(
                            target: "router.redis",
                            connection_id = %connection_id,
                            error = %err,
                            "dropping undecodable signal payload"
                        );
                        observability::record_protocol_error();
                        continue;
                    }
                };
                match envelope.message {
                    Some(signal_node_message::Message::Response(response)) => {
                        if response_feed.write_message(response).await.is_err() {
                            // Overflow or local close; the close link tears
                            // the rest of the pipe down.
                            break;
                        }
                    }
                    Some(signal_node_message::Message::EndSession(_)) => {
                        debug!(
                            target: "router.redis",
                            connection_id = %connection_id,
                            "end of session received"
                        );
                        response_feed.close_now();
                        break;
                    }
                    None => {
                        warn!(
                            target: "router.redis",
                            connection_id = %connection_id,
                            "signal envelope without message"
                        );
                        observability::record_protocol_error();
                    }
                }
            }
        }
    }
}

async fn run_heartbeat_loop(inner: Arc<RedisRouterInner>) {
    let mut ticker = tokio::time::interval(inner.config.refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = inner.loops_cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = inner.store.register_node(inner.node.snapshot()).await {
                    warn!(
                        target: "router.redis",
                        node_id = %inner.node.id(),
                        error = %err,
                        "heartbeat write failed"
                    );
                }
            }
        }
    }
}

async fn run_evictor_loop(inner: Arc<RedisRouterInner>) {
    let mut ticker = tokio::time::interval(inner.config.refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = inner.loops_cancel.cancelled() => break,
            _ = ticker.tick() => {
                match inner.store.remove_dead_nodes().await {
                    Ok(0) => {}
                    Ok(removed) => {
                        info!(
                            target: "router.redis",
                            node_id = %inner.node.id(),
                            removed = removed,
                            "evicted dead nodes"
                        );
                        observability::record_dead_nodes_removed(removed);
                    }
                    Err(err) => {
                        warn!(
                            target: "router.redis",
                            node_id = %inner.node.id(),
                            error = %err,
                            "dead node eviction failed"
                        );
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Router for RedisRouter {
    fn local_node_id(&self) -> &str {
        self.inner.node.id()
    }

    async fn register_node(&self) -> Result<(), RouterError> {
        self.inner
            .store
            .register_node(self.inner.node.snapshot())
            .await
    }

    async fn unregister_node(&self) -> Result<(), RouterError> {
        self.inner.store.unregister_node(self.inner.node.id()).await
    }

    async fn get_node(&self, node_id: &str) -> Result<Node, RouterError> {
        self.inner.store.get_node(node_id).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, RouterError> {
        self.inner.store.list_nodes().await
    }

    async fn remove_dead_nodes(&self) -> Result<usize, RouterError> {
        self.inner.store.remove_dead_nodes().await
    }

    async fn get_node_for_room(&self, room_name: &str) -> Result<Node, RouterError> {
        let node_id = self.inner.store.get_node_for_room(room_name).await?;
        self.inner.store.get_node(&node_id).await
    }

    async fn set_node_for_room(
        &self,
        room_name: &str,
        node_id: &str,
    ) -> Result<String, RouterError> {
        let bound = self
            .inner
            .store
            .set_node_for_room(room_name, node_id)
            .await?;
        if bound == self.inner.node.id() {
            ensure_room_subscription(&self.inner, room_name).await?;
        }
        Ok(bound)
    }

    async fn clear_room_state(&self, room_name: &str) -> Result<(), RouterError> {
        self.inner.store.clear_room_state(room_name).await?;

        let cancel = self
            .inner
            .room_subscriptions
            .lock()
            .await
            .get(room_name)
            .map(|sub| sub.cancel.clone());
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        Ok(())
    }

    #[instrument(skip_all, fields(room_name = %room_name, identity = %init.identity))]
    async fn start_participant_signal(
        &self,
        room_name: &str,
        init: ParticipantInit,
    ) -> Result<SignalConnection, RouterError> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(RouterError::Unavailable("router not started".to_string()));
        }

        let owner = resolve_room_node(
            &self.inner.store,
            self.inner.selector.as_ref(),
            room_name,
            self.inner.config.expire_after,
        )
        .await?;
        if owner.id == self.inner.node.id() {
            ensure_room_subscription(&self.inner, room_name).await?;
        }

        let connection_id = uuid::Uuid::new_v4().to_string();
        let participant_key = router_proto::participant_key(room_name, &init.identity);

        // The response subject must have its consumer before anything is
        // published toward the RTC side.
        let subject = keys::signal_subject(&connection_id);
        let subscribe = async {
            let mut pubsub = self.inner.client.get_async_pubsub().await?;
            pubsub.subscribe(&subject).await?;
            redis::RedisResult::Ok(pubsub)
        };
        let pubsub =
            match tokio::time::timeout(self.inner.config.operation_timeout, subscribe).await {
                Ok(Ok(pubsub)) => pubsub,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    return Err(RouterError::Canceled(
                        "subscribe deadline exceeded".to_string(),
                    ))
                }
            };

        let (response_feed, response_source) =
            message_channel::<SignalResponse>(self.inner.config.channel_capacity, Direction::Response);

        let encode_key = participant_key.clone();
        let request_sink = FabricSink::new(
            self.inner.connection.clone(),
            keys::rtc_subject(room_name),
            self.inner.config.operation_timeout,
            Box::new(move |request: &SignalRequest| {
                RtcNodeMessage {
                    participant_key: encode_key.clone(),
                    message: Some(rtc_node_message::Message::Request(request.clone())),
                }
                .encode_to_vec()
            }),
            None,
        );

        let guard = CloseOnDrop::arm(request_sink.closed_token());
        let subscription_cancel = self.inner.cancel.child_token();

        tokio::spawn(run_signal_subscription(
            connection_id.clone(),
            pubsub,
            subscription_cancel.clone(),
            Arc::clone(&response_feed),
        ));

        {
            let inner = Arc::clone(&self.inner);
            let request_sink = Arc::clone(&request_sink);
            let response_feed = Arc::clone(&response_feed);
            let subscription_cancel = subscription_cancel.clone();
            let connection_id = connection_id.clone();
            spawn_close_link(
                request_sink.closed_token(),
                response_feed.closed_token(),
                async move {
                    request_sink.close_now().await;
                    response_feed.close_now();
                    subscription_cancel.cancel();
                    let mut pipes = inner.signal_pipes.lock().await;
                    if pipes.remove(&connection_id).is_some() {
                        observability::set_signal_pipes_active(pipes.len());
                    }
                },
            );
        }

        let start = RtcNodeMessage {
            participant_key: participant_key.clone(),
            message: Some(rtc_node_message::Message::StartSession(
                init.into_start_session(room_name, &connection_id),
            )),
        };
        self.inner
            .publish(&keys::rtc_subject(room_name), start.encode_to_vec())
            .await?;

        {
            let mut pipes = self.inner.signal_pipes.lock().await;
            pipes.insert(
                connection_id.clone(),
                SignalPipe {
                    request_sink: Arc::clone(&request_sink),
                    response_feed,
                },
            );
            observability::set_signal_pipes_active(pipes.len());
        }
        guard.disarm();

        debug!(
            target: "router.redis",
            connection_id = %connection_id,
            rtc_node = %owner.id,
            "participant signal established"
        );

        Ok(SignalConnection {
            connection_id,
            request_sink,
            response_source,
        })
    }

    async fn write_rtc_message(
        &self,
        room_name: &str,
        identity: &str,
        message: rtc_node_message::Message,
    ) -> Result<(), RouterError> {
        // Verify the room is assigned; publishing to an ownerless subject
        // would silently drop the message.
        let _owner = self.inner.store.get_node_for_room(room_name).await?;

        observability::record_rtc_message(observability::rtc_message_kind(&message));

        let envelope = RtcNodeMessage {
            participant_key: router_proto::participant_key(room_name, identity),
            message: Some(message),
        };
        self.inner
            .publish(&keys::rtc_subject(room_name), envelope.encode_to_vec())
            .await
    }

    fn set_track_stats(&self, num_tracks_in: u32, num_tracks_out: u32) {
        self.inner.node.set_track_stats(num_tracks_in, num_tracks_out);
    }

    fn on_new_participant(&self, callback: NewParticipantCallback) {
        self.inner.callbacks.set_new_participant(callback);
    }

    fn on_rtc_message(&self, callback: RtcMessageCallback) {
        self.inner.callbacks.set_rtc_message(callback);
    }

    async fn start(&self) -> Result<(), RouterError> {
        self.inner.callbacks.require_registered()?;
        if self.inner.cancel.is_cancelled() {
            return Err(RouterError::Protocol(
                "router has been stopped".to_string(),
            ));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(RouterError::Protocol(
                "router already started".to_string(),
            ));
        }

        if let Err(err) = self.register_node().await {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(run_heartbeat_loop(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(run_evictor_loop(Arc::clone(&self.inner))));

        info!(target: "router.redis", node_id = %self.inner.node.id(), "router started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.loops_cancel.cancel();

        if let Err(err) = self.unregister_node().await {
            warn!(
                target: "router.redis",
                node_id = %self.inner.node.id(),
                error = %err,
                "best-effort unregister failed"
            );
        }

        // Grace window for the upper layer to finish closing its pipes.
        let deadline = tokio::time::Instant::now() + self.inner.config.drain_grace;
        while tokio::time::Instant::now() < deadline {
            let drained = self.inner.signal_pipes.lock().await.is_empty()
                && self.inner.rtc_pipes.lock().await.is_empty();
            if drained {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let rtc_pipes: Vec<_> = {
            let pipes = self.inner.rtc_pipes.lock().await;
            pipes
                .values()
                .map(|pipe| {
                    (
                        Arc::clone(&pipe.request_feed),
                        Arc::clone(&pipe.response_sink),
                    )
                })
                .collect()
        };
        for (request_feed, response_sink) in rtc_pipes {
            request_feed.close_now();
            response_sink.close_now().await;
        }

        let signal_pipes: Vec<_> = {
            let pipes = self.inner.signal_pipes.lock().await;
            pipes
                .values()
                .map(|pipe| {
                    (
                        Arc::clone(&pipe.request_sink),
                        Arc::clone(&pipe.response_feed),
                    )
                })
                .collect()
        };
        for (request_sink, response_feed) in signal_pipes {
            request_sink.close_now().await;
            response_feed.close_now();
        }

        self.inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }

        info!(target: "router.redis", node_id = %self.inner.node.id(), "router stopped");
    }
}
