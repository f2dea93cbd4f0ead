//! WebSocket client for adapters that publish normalized messages.
//!
//! Features:
//! - Automatic reconnection with exponential backoff
//! - Staleness detection (no frame within two heartbeat intervals)
//! - A `Reconnected` event after every successful reconnect so books resnapshot

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::message::NormalizedMessage;
use super::source::{BackoffConfig, FeedEvent};
use crate::error::FeedError;
use crate::metrics;

/// WebSocket subscription message.
#[derive(Debug, Serialize)]
struct SubscribeMessage {
    /// Message type.
    #[serde(rename = "type")]
    msg_type: &'static str,
    /// Trading pairs to subscribe to.
    trading_pairs: Vec<String>,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Server closed or the feed went stale; reconnect.
    Disconnected,
    /// Nobody is listening any more; stop.
    ReceiverGone,
}

/// Decode one text frame into normalized messages.
///
/// Frames can be single objects or arrays. Entries that fail to decode are
/// logged and dropped individually so one bad entry does not lose the batch.
pub fn decode_frame(text: &str) -> Vec<NormalizedMessage> {
    let values: Vec<serde_json::Value> = if text.trim_start().starts_with('[') {
        serde_json::from_str(text).unwrap_or_else(|e| {
            warn!(error = %e, "Dropping undecodable feed frame");
            metrics::inc_malformed_messages("websocket");
            Vec::new()
        })
    } else {
        match serde_json::from_str(text) {
            Ok(value) => vec![value],
            Err(e) => {
                warn!(error = %e, "Dropping undecodable feed frame");
                metrics::inc_malformed_messages("websocket");
                Vec::new()
            }
        }
    };

    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<NormalizedMessage>(value) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "Dropping malformed feed message");
                metrics::inc_malformed_messages("websocket");
                None
            }
        })
        .collect()
}

/// Push feed of normalized messages over WebSocket.
pub struct NormalizedWsFeed {
    /// WebSocket URL.
    url: String,
    /// Reconnection backoff.
    backoff: BackoffConfig,
    /// Expected heartbeat interval from the server.
    heartbeat_interval: Duration,
    /// Connection state (atomic for thread safety).
    connected: Arc<AtomicBool>,
    /// Reconnection attempt counter.
    reconnect_attempts: Arc<AtomicU64>,
}

impl NormalizedWsFeed {
    /// Create a new feed client.
    pub fn new(url: impl Into<String>, backoff: BackoffConfig, heartbeat_interval: Duration) -> Self {
        Self {
            url: url.into(),
            backoff,
            heartbeat_interval,
            connected: Arc::new(AtomicBool::new(false)),
            reconnect_attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get reconnection attempt count.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Run with automatic reconnection on disconnect.
    ///
    /// Returns a channel receiver that yields feed events. Dropping the
    /// receiver stops the connection task.
    pub fn run_with_reconnect(
        self: Arc<Self>,
        trading_pairs: Vec<String>,
        capacity: usize,
    ) -> mpsc::Receiver<FeedEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        let ws = self;

        tokio::spawn(async move {
            let mut attempt = 0u32;
            let mut ever_connected = false;

            loop {
                info!(url = %ws.url, attempt, "Attempting feed connection");

                match ws.run_session(&trading_pairs, &tx, ever_connected).await {
                    Ok(SessionEnd::ReceiverGone) => {
                        info!("Feed receiver dropped, stopping WebSocket");
                        ws.connected.store(false, Ordering::SeqCst);
                        return;
                    }
                    Ok(SessionEnd::Disconnected) => {
                        ever_connected = true;
                        attempt = 0;
                        warn!("Feed stream ended, will reconnect");
                    }
                    Err(e) => {
                        error!(error = %e, attempt, "Feed connection failed");
                    }
                }
                ws.connected.store(false, Ordering::SeqCst);

                let delay = ws.backoff.next_delay(attempt);
                ws.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                metrics::inc_feed_reconnects();

                info!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                attempt = attempt.saturating_add(1);
            }
        });

        rx
    }

    async fn run_session(
        &self,
        trading_pairs: &[String],
        tx: &mpsc::Sender<FeedEvent>,
        is_reconnect: bool,
    ) -> Result<SessionEnd, FeedError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let subscribe = SubscribeMessage {
            msg_type: "subscribe",
            trading_pairs: trading_pairs.to_vec(),
        };
        let msg_json =
            serde_json::to_string(&subscribe).map_err(|e| FeedError::SendFailed(e.to_string()))?;
        write
            .send(Message::Text(msg_json))
            .await
            .map_err(|e| FeedError::SendFailed(e.to_string()))?;

        self.connected.store(true, Ordering::SeqCst);
        info!(pairs = trading_pairs.len(), "Subscribed to feed");

        if is_reconnect && tx.send(FeedEvent::Reconnected).await.is_err() {
            return Ok(SessionEnd::ReceiverGone);
        }

        let stale_after = self.heartbeat_interval * 2;

        loop {
            let next = tokio::select! {
                _ = tx.closed() => return Ok(SessionEnd::ReceiverGone),
                next = tokio::time::timeout(stale_after, read.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    warn!(stale_after_ms = stale_after.as_millis() as u64, "Feed went stale");
                    return Ok(SessionEnd::Disconnected);
                }
                Ok(None) => return Ok(SessionEnd::Disconnected),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => {
                    for message in decode_frame(&text) {
                        if tx.send(FeedEvent::Message(message)).await.is_err() {
                            return Ok(SessionEnd::ReceiverGone);
                        }
                    }
                }
                Message::Ping(_) => {
                    debug!("Received ping");
                    // Note: tungstenite auto-responds to pings
                }
                Message::Pong(_) => debug!("Received pong"),
                Message::Close(frame) => {
                    warn!(frame = ?frame, "WebSocket closed");
                    return Ok(SessionEnd::Disconnected);
                }
                _ => {}
            }
        }
    }
}
