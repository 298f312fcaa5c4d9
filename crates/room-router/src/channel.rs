//! Typed message conduits between the signal and RTC ends of a session pipe.
//!
//! A [`MessageSink`] accepts protocol messages and is closable exactly once;
//! a [`MessageSource`] yields the ordered, finite sequence the paired sink
//! admitted. End-of-sequence on the source means the peer has closed.
//!
//! The in-memory realization is a bounded FIFO: [`message_channel`] returns
//! the two halves. Writes never block; when the buffer is full the sink
//! closes itself, because real-time signalling gains nothing from stale,
//! queued messages. Messages admitted before close are flushed to the source
//! before it reports end-of-sequence.
//!
//! Each sink exposes a close token. The two directions of a session pipe are
//! glued with [`spawn_close_link`]: whichever side closes first drags the
//! other down, so a pipe never ends up half-open.

use crate::errors::RouterError;
use crate::observability;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Observer invoked once after a sink closes.
pub type CloseObserver = Box<dyn FnOnce() + Send + 'static>;

/// Write half of a message conduit.
///
/// Implementations are non-blocking: a write either enqueues, publishes, or
/// fails. `close` is idempotent and may be called from any task.
#[async_trait]
pub trait MessageSink<M: Send + 'static>: Send + Sync {
    /// Write a message toward the paired source.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Closed`] once the sink has closed (including a
    /// close triggered by this very write overflowing the buffer), and
    /// fabric errors for distributed sinks.
    async fn write_message(&self, msg: M) -> Result<(), RouterError>;

    /// Close the sink. The paired source reaches end-of-sequence after
    /// draining messages admitted before the close.
    async fn close(&self);

    /// Register the close observer. At most one observer is held;
    /// re-registration replaces. The observer fires exactly once, after the
    /// sink closes for any reason. Registering on an already-closed sink
    /// fires immediately.
    fn on_close(&self, observer: CloseObserver);

    /// Whether the sink has closed.
    fn is_closed(&self) -> bool;
}

/// Close bookkeeping shared by sink implementations.
///
/// Splitting close into begin/finish lets distributed sinks publish their
/// close marker between rejecting new writes and notifying observers.
pub(crate) struct SinkShared {
    closed: AtomicBool,
    observer: Mutex<Option<CloseObserver>>,
    token: CancellationToken,
}

impl SinkShared {
    pub(crate) fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            observer: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    /// Mark the sink closed. Returns false when it already was.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Fire the observer and cancel the close token.
    pub(crate) fn finish_close(&self) {
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(observer) = observer {
            observer();
        }
        self.token.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn register_observer(&self, observer: CloseObserver) {
        {
            let mut slot = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
            *slot = Some(observer);
        }
        // A close may have raced past the store above without seeing the
        // observer; drain the slot ourselves in that case.
        if self.is_closed() {
            let observer = self
                .observer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(observer) = observer {
                observer();
            }
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// In-memory bounded sink; the local half of every session pipe direction.
pub struct ChannelSink<M> {
    tx: Mutex<Option<mpsc::Sender<M>>>,
    direction: observability::Direction,
    shared: SinkShared,
}

/// Read half of a message conduit.
pub struct MessageSource<M> {
    rx: mpsc::Receiver<M>,
}

/// Create a bounded in-memory conduit of the given capacity.
///
/// # Panics
///
/// Panics if `capacity` is zero; configuration validation rejects that
/// before any channel is built.
pub(crate) fn message_channel<M: Send + 'static>(
    capacity: usize,
    direction: observability::Direction,
) -> (Arc<ChannelSink<M>>, MessageSource<M>) {
    let (tx, rx) = mpsc::channel(capacity);
    let sink = Arc::new(ChannelSink {
        tx: Mutex::new(Some(tx)),
        direction,
        shared: SinkShared::new(),
    });
    (sink, MessageSource { rx })
}

impl<M: Send + 'static> ChannelSink<M> {
    /// Synchronous close; drops the sender so the source drains then ends.
    pub fn close_now(&self) {
        if !self.shared.begin_close() {
            return;
        }
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.finish_close();
    }

    /// Token cancelled when this sink closes; used to glue pipe directions.
    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.shared.token()
    }
}

#[async_trait]
impl<M: Send + 'static> MessageSink<M> for ChannelSink<M> {
    async fn write_message(&self, msg: M) -> Result<(), RouterError> {
        if self.shared.is_closed() {
            return Err(RouterError::Closed);
        }
        let tx = {
            let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(RouterError::Closed);
        };
        match tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(
                    target: "router.pipe",
                    direction = ?self.direction,
                    "channel buffer full, closing pipe"
                );
                observability::record_overflow(self.direction);
                self.close_now();
                Err(RouterError::Closed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close_now();
                Err(RouterError::Closed)
            }
        }
    }

    async fn close(&self) {
        self.close_now();
    }

    fn on_close(&self, observer: CloseObserver) {
        self.shared.register_observer(observer);
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl<M: Send> MessageSource<M> {
    /// Receive the next message.
    ///
    /// Returns `None` at end-of-sequence, meaning the peer has closed and
    /// all messages admitted before the close have been delivered.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }
}

/// Glue the two directions of a session pipe: once either token fires, run
/// the cleanup (close both sinks, release registrations).
///
/// Cleanup closes are idempotent, so the initiating side being already
/// closed is fine.
pub(crate) fn spawn_close_link<F>(
    first: CancellationToken,
    second: CancellationToken,
    cleanup: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            () = first.cancelled() => {}
            () = second.cancelled() => {}
        }
        cleanup.await;
    })
}

/// Cancels a sink's close token when dropped without being disarmed.
///
/// Guards partial pipe state while `start_participant_signal` is in flight:
/// if the caller drops the future mid-establishment, the token fires and the
/// close link tears everything down.
pub(crate) struct CloseOnDrop {
    token: Option<CancellationToken>,
}

impl CloseOnDrop {
    pub(crate) fn arm(token: CancellationToken) -> Self {
        Self { token: Some(token) }
    }

    pub(crate) fn disarm(mut self) {
        self.token = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}
