//! Publishing half of a distributed session pipe direction.
//!
//! A [`FabricSink`] encodes each message into its subject's envelope and
//! publishes it. A publish failure closes the sink: mid-session fabric loss
//! must surface to the owner as a pipe close, not as an error the caller can
//! retry into a half-dead pipe.

use crate::channel::{CloseObserver, MessageSink, SinkShared};
use crate::errors::RouterError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Encodes a message into the subject's envelope payload.
type EncodeFn<M> = Box<dyn Fn(&M) -> Vec<u8> + Send + Sync>;

/// Sink that publishes messages on a fabric subject.
pub struct FabricSink<M> {
    connection: MultiplexedConnection,
    subject: String,
    encode: EncodeFn<M>,
    /// Pre-encoded marker published on close (the RTC side's `EndSession`);
    /// `None` for directions that close silently.
    close_marker: Option<Vec<u8>>,
    publish_timeout: Duration,
    shared: SinkShared,
}

impl<M: Send + 'static> FabricSink<M> {
    pub(crate) fn new(
        connection: MultiplexedConnection,
        subject: String,
        publish_timeout: Duration,
        encode: EncodeFn<M>,
        close_marker: Option<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            subject,
            encode,
            close_marker,
            publish_timeout,
            shared: SinkShared::new(),
        })
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.shared.token()
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<(), RouterError> {
        let mut conn = self.connection.clone();
        let publish = async {
            let result: redis::RedisResult<()> = conn.publish(&self.subject, payload).await;
            result
        };
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(RouterError::Canceled(
                "publish deadline exceeded".to_string(),
            )),
        }
    }

    /// Close, publishing the close marker when one is configured.
    pub(crate) async fn close_now(&self) {
        if !self.shared.begin_close() {
            return;
        }
        if let Some(marker) = &self.close_marker {
            if let Err(err) = self.publish(marker.clone()).await {
                warn!(
                    target: "router.pipe",
                    subject = %self.subject,
                    error = %err,
                    "failed to publish close marker"
                );
            }
        }
        debug!(target: "router.pipe", subject = %self.subject, "fabric sink closed");
        self.shared.finish_close();
    }
}

#[async_trait]
impl<M: Send + Sync + 'static> MessageSink<M> for FabricSink<M> {
    async fn write_message(&self, msg: M) -> Result<(), RouterError> {
        if self.shared.is_closed() {
            return Err(RouterError::Closed);
        }
        let payload = (self.encode)(&msg);
        match self.publish(payload).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    target: "router.pipe",
                    subject = %self.subject,
                    error = %err,
                    "publish failed, closing pipe"
                );
                self.close_now().await;
                Err(err)
            }
        }
    }

    async fn close(&self) {
        self.close_now().await;
    }

    fn on_close(&self, observer: CloseObserver) {
        self.shared.register_observer(observer);
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}
