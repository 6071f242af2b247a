//! Notification handling for Tuya devices
//! Turns the notify characteristic's callback-style stream into an owned
//! chunk stream the session can consume with its own timeouts.

use std::fmt::Display;

use bluest::Characteristic;
use futures_util::{Stream, StreamExt};
use log::{debug, error, info};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::NOTIFICATION_BUFFER;
use crate::core::bluetooth::types::ChunkStream;
use crate::core::error::TransportError;

type Ready = oneshot::Sender<Result<(), TransportError>>;

/// Forwards notifications of one characteristic into a channel
pub struct NotificationHandler {
    cancel_token: CancellationToken,
}

impl NotificationHandler {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
        }
    }

    /// Subscribes to `notify_char` and returns its chunk stream.
    ///
    /// Returns only once the device has accepted the subscription, so no
    /// notification sent in reply to a later write can be missed.
    pub async fn setup_notifications(
        &self,
        notify_char: Characteristic,
    ) -> Result<ChunkStream, TransportError> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel_token = self.cancel_token.child_token();

        tokio::spawn(async move {
            let uuid = notify_char.uuid();
            info!("Subscribing to notifications on {}", uuid);
            let subscription = notify_char
                .notify()
                .await
                .map_err(|e| TransportError::SubscribeFailed(format!("{}: {}", uuid, e)));
            forward_chunks(subscription, ready_tx, tx, cancel_token).await;
        });

        Self::await_subscription(ready_rx, rx).await
    }

    async fn await_subscription(
        ready: oneshot::Receiver<Result<(), TransportError>>,
        rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<ChunkStream, TransportError> {
        match ready.await {
            Ok(Ok(())) => Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            }))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::SubscribeFailed(
                "notification task ended before subscribing".to_string(),
            )),
        }
    }

    /// Stops every forwarding task started by this handler
    pub fn stop_notifications(&self) {
        self.cancel_token.cancel();
    }
}

impl Default for NotificationHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Reports the subscription result on `ready`, then forwards chunks until
/// the stream ends, the receiver goes away or `cancel_token` fires.
async fn forward_chunks<S, E>(
    subscription: Result<S, TransportError>,
    ready: Ready,
    tx: mpsc::Sender<Vec<u8>>,
    cancel_token: CancellationToken,
) where
    S: Stream<Item = Result<Vec<u8>, E>>,
    E: Display,
{
    let notification_stream = match subscription {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to subscribe to notifications: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut notification_stream = std::pin::pin!(notification_stream);
    if ready.send(Ok(())).is_err() {
        debug!("Subscriber went away before the stream was ready");
        return;
    }

    loop {
        tokio::select! {
            result = notification_stream.next() => {
                match result {
                    Some(Ok(value)) => {
                        debug!("Received chunk: {:02x?}", value);
                        if tx.send(value).await.is_err() {
                            debug!("Chunk receiver dropped");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error in notification stream: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }

    info!("Notification stream ended");
}
