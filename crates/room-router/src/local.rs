//! Single-process realization of the router.
//!
//! Both ends of every session pipe live in this process, so each direction
//! is one bounded in-memory channel and the fabric is replaced by an
//! in-process dispatch loop. The registry and directory contracts are still
//! honored (heartbeat, evictor, first-writer-wins assignment) so the upper
//! layer behaves identically in both modes.

use crate::channel::{
    message_channel, spawn_close_link, ChannelSink, CloseOnDrop, MessageSink, MessageSource,
};
use crate::config::RouterConfig;
use crate::errors::RouterError;
use crate::node::LocalNode;
use crate::observability::{self, Direction};
use crate::router::{
    resolve_room_node, CallbackRegistry, NewParticipantCallback, ParticipantInit, Router,
    RtcMessageCallback, SignalConnection,
};
use crate::selector::NodeSelector;
use crate::store::{LocalStore, NodeRegistry, RoomDirectory};
use async_trait::async_trait;
use router_proto::internal::{rtc_node_message, Node, RtcNodeMessage, SignalRequest, SignalResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Buffer size for the in-process dispatch channel standing in for the
/// fabric.
const DISPATCH_CHANNEL_BUFFER: usize = 1_024;

/// Work delivered to the RTC-side dispatch loop.
enum RtcDispatch {
    NewParticipant {
        room_name: String,
        init: ParticipantInit,
        request_source: MessageSource<SignalRequest>,
        response_sink: Arc<dyn MessageSink<SignalResponse>>,
    },
    Message {
        room_name: String,
        identity: String,
        message: RtcNodeMessage,
    },
}

struct LocalPipe {
    request_sink: Arc<ChannelSink<SignalRequest>>,
    response_sink: Arc<ChannelSink<SignalResponse>>,
}

struct LocalRouterInner {
    config: RouterConfig,
    node: LocalNode,
    store: Arc<LocalStore>,
    selector: Box<dyn NodeSelector>,
    callbacks: CallbackRegistry,
    dispatch_tx: StdMutex<Option<mpsc::Sender<RtcDispatch>>>,
    pipes: Mutex<HashMap<String, LocalPipe>>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Router for a process that is its own fleet.
pub struct LocalRouter {
    inner: Arc<LocalRouterInner>,
}

impl LocalRouter {
    /// Create a local router with its own in-memory store.
    #[must_use]
    pub fn new(config: RouterConfig, selector: Box<dyn NodeSelector>) -> Self {
        let store = Arc::new(LocalStore::new(config.expire_after));
        Self::with_store(config, selector, store)
    }

    /// Create a local router over an existing store. Lets tests stage fleet
    /// state (stale nodes, pre-existing assignments) before starting.
    #[must_use]
    pub fn with_store(
        config: RouterConfig,
        selector: Box<dyn NodeSelector>,
        store: Arc<LocalStore>,
    ) -> Self {
        let node = LocalNode::new(&config);
        Self {
            inner: Arc::new(LocalRouterInner {
                config,
                node,
                store,
                selector,
                callbacks: CallbackRegistry::new(),
                dispatch_tx: StdMutex::new(None),
                pipes: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    fn dispatch_sender(&self) -> Result<mpsc::Sender<RtcDispatch>, RouterError> {
        self.inner
            .dispatch_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| RouterError::Unavailable("router not started".to_string()))
    }

    async fn dispatch(&self, work: RtcDispatch) -> Result<(), RouterError> {
        let sender = self.dispatch_sender()?;
        match tokio::time::timeout(self.inner.config.operation_timeout, sender.send(work)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RouterError::Unavailable(
                "dispatch loop stopped".to_string(),
            )),
            Err(_) => Err(RouterError::Canceled(
                "dispatch deadline exceeded".to_string(),
            )),
        }
    }
}

async fn run_dispatch_loop(
    inner: Arc<LocalRouterInner>,
    mut receiver: mpsc::Receiver<RtcDispatch>,
) {
    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => break,
            work = receiver.recv() => {
                let Some(work) = work else { break };
                match work {
                    RtcDispatch::NewParticipant {
                        room_name,
                        init,
                        request_source,
                        response_sink,
                    } => {
                        if let Some(callback) = inner.callbacks.new_participant() {
                            callback(room_name, init, request_source, response_sink);
                        }
                    }
                    RtcDispatch::Message {
                        room_name,
                        identity,
                        message,
                    } => {
                        if let Some(callback) = inner.callbacks.rtc_message() {
                            callback(room_name, identity, message);
                        }
                    }
                }
            }
        }
    }
    debug!(target: "router.local", node_id = %inner.node.id(), "dispatch loop stopped");
}

async fn run_heartbeat_loop(inner: Arc<LocalRouterInner>) {
    let mut ticker = tokio::time::interval(inner.config.refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = inner.store.register_node(inner.node.snapshot()).await {
                    warn!(
                        target: "router.local",
                        node_id = %inner.node.id(),
                        error = %err,
                        "heartbeat write failed"
                    );
                }
            }
        }
    }
}

async fn run_evictor_loop(inner: Arc<LocalRouterInner>) {
    let mut ticker = tokio::time::interval(inner.config.refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {
                match inner.store.remove_dead_nodes().await {
                    Ok(0) => {}
                    Ok(removed) => {
                        info!(
                            target: "router.local",
                            node_id = %inner.node.id(),
                            removed = removed,
                            "evicted dead nodes"
                        );
                        observability::record_dead_nodes_removed(removed);
                    }
                    Err(err) => {
                        warn!(
                            target: "router.local",
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
impl Router for LocalRouter {
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
        self.inner.store.set_node_for_room(room_name, node_id).await
    }

    async fn clear_room_state(&self, room_name: &str) -> Result<(), RouterError> {
        self.inner.store.clear_room_state(room_name).await
    }

    #[instrument(skip_all, fields(room_name = %room_name, identity = %init.identity))]
    async fn start_participant_signal(
        &self,
        room_name: &str,
        init: ParticipantInit,
    ) -> Result<SignalConnection, RouterError> {
        let owner = resolve_room_node(
            self.inner.store.as_ref(),
            self.inner.selector.as_ref(),
            room_name,
            self.inner.config.expire_after,
        )
        .await?;

        if owner.id != self.inner.node.id() {
            return Err(RouterError::Unavailable(format!(
                "room {room_name} is bound to {}, which a single-process router cannot reach",
                owner.id
            )));
        }

        let connection_id = uuid::Uuid::new_v4().to_string();
        let capacity = self.inner.config.channel_capacity;
        let (request_sink, request_source) =
            message_channel::<SignalRequest>(capacity, Direction::Request);
        let (response_sink, response_source) =
            message_channel::<SignalResponse>(capacity, Direction::Response);

        let guard = CloseOnDrop::arm(request_sink.closed_token());

        {
            let inner = Arc::clone(&self.inner);
            let request_sink = Arc::clone(&request_sink);
            let response_sink = Arc::clone(&response_sink);
            let connection_id = connection_id.clone();
            spawn_close_link(
                request_sink.closed_token(),
                response_sink.closed_token(),
                async move {
                    request_sink.close_now();
                    response_sink.close_now();
                    let mut pipes = inner.pipes.lock().await;
                    pipes.remove(&connection_id);
                    observability::set_signal_pipes_active(pipes.len());
                },
            );
        }

        self.dispatch(RtcDispatch::NewParticipant {
            room_name: room_name.to_string(),
            init,
            request_source,
            response_sink: Arc::clone(&response_sink) as Arc<dyn MessageSink<SignalResponse>>,
        })
        .await?;

        {
            let mut pipes = self.inner.pipes.lock().await;
            pipes.insert(
                connection_id.clone(),
                LocalPipe {
                    request_sink: Arc::clone(&request_sink),
                    response_sink,
                },
            );
            observability::set_signal_pipes_active(pipes.len());
        }
        guard.disarm();

        debug!(
            target: "router.local",
            connection_id = %connection_id,
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
        let owner_id = self.inner.store.get_node_for_room(room_name).await?;
        if owner_id != self.inner.node.id() {
            return Err(RouterError::Unavailable(format!(
                "room {room_name} is bound to {owner_id}, which a single-process router cannot reach"
            )));
        }

        observability::record_rtc_message(observability::rtc_message_kind(&message));

        self.dispatch(RtcDispatch::Message {
            room_name: room_name.to_string(),
            identity: identity.to_string(),
            message: RtcNodeMessage {
                participant_key: router_proto::participant_key(room_name, identity),
                message: Some(message),
            },
        })
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

        let (tx, rx) = mpsc::channel(DISPATCH_CHANNEL_BUFFER);
        *self
            .inner
            .dispatch_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(run_dispatch_loop(
            Arc::clone(&self.inner),
            rx,
        )));
        tasks.push(tokio::spawn(run_heartbeat_loop(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(run_evictor_loop(Arc::clone(&self.inner))));

        info!(target: "router.local", node_id = %self.inner.node.id(), "router started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.cancel.cancel();
        *self
            .inner
            .dispatch_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        if let Err(err) = self.unregister_node().await {
            warn!(
                target: "router.local",
                node_id = %self.inner.node.id(),
                error = %err,
                "best-effort unregister failed"
            );
        }

        // Grace window for the upper layer to finish closing its pipes.
        let deadline = tokio::time::Instant::now() + self.inner.config.drain_grace;
        while tokio::time::Instant::now() < deadline {
            if self.inner.pipes.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let remaining: Vec<LocalPipe> = self
            .inner
            .pipes
            .lock()
            .await
            .drain()
            .map(|(_, pipe)| pipe)
            .collect();
        if !remaining.is_empty() {
            info!(
                target: "router.local",
                node_id = %self.inner.node.id(),
                remaining = remaining.len(),
                "force-closing pipes after drain grace"
            );
        }
        for pipe in remaining {
            pipe.request_sink.close_now();
            pipe.response_sink.close_now();
        }
        observability::set_signal_pipes_active(0);

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

        info!(target: "router.local", node_id = %self.inner.node.id(), "router stopped");
    }
}
