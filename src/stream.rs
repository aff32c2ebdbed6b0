//! Upstream position report stream
//!
//! Keeps a WebSocket subscription to aisstream.io alive, decodes every
//! frame into a [`PendingUpdate`](crate::models::PendingUpdate) and appends it to the shared
//! [`UpdateBuffer`]. Any transport failure drops the session and reconnects
//! after an exponential, jittered delay.

mod backoff;

use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{
    buffer::UpdateBuffer,
    config::StreamConfig,
    errors::{DecodeError, StreamError},
    models::{StreamFrame, POSITION_REPORT},
    stats::IngestStats,
};

pub use backoff::Backoff;

/// Connection lifecycle of the ingestor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestState {
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    Reconnecting,
}

/// Subscription request, the first frame sent on every connection
#[derive(Debug, Serialize)]
struct Subscription<'a> {
    #[serde(rename = "APIKey")]
    api_key: &'a str,
    #[serde(rename = "BoundingBoxes")]
    bounding_boxes: Vec<[[f64; 2]; 2]>,
    #[serde(rename = "FilterMessageTypes")]
    filter_message_types: [&'static str; 1],
}

const WHOLE_WORLD: [[f64; 2]; 2] = [[-90.0, -180.0], [90.0, 180.0]];

pub struct StreamIngestor {
    config: StreamConfig,
    buffer: UpdateBuffer,
    stats: Arc<IngestStats>,
    state: watch::Sender<IngestState>,
}

impl StreamIngestor {
    pub fn new(config: StreamConfig, buffer: UpdateBuffer, stats: Arc<IngestStats>) -> Self {
        let (state, _) = watch::channel(IngestState::Disconnected);
        Self {
            config,
            buffer,
            stats,
            state,
        }
    }

    /// Follow state transitions.
    pub fn state(&self) -> watch::Receiver<IngestState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: IngestState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Ingest state {:?} -> {:?}", previous, next);
        }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.backoff_initial_ms, self.config.backoff_max_ms);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            self.set_state(IngestState::Connecting);
            match self.session(&mut backoff, &mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    warn!("Stream session ended: {}", e);
                    IngestStats::incr(&self.stats.reconnects);
                }
            }

            self.set_state(IngestState::Reconnecting);
            let delay = backoff.next_delay();
            info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_requested(&mut shutdown) => break,
            }
        }

        self.set_state(IngestState::Disconnected);
        info!("Stream ingestor stopped");
    }

    async fn session(
        &self,
        backoff: &mut Backoff,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), StreamError> {
        info!("Connecting to {}", self.config.url);
        let connect = async {
            let (mut ws, _) = tokio::time::timeout(
                self.config.connect_timeout,
                tokio_tungstenite::connect_async(self.config.url.as_str()),
            )
            .await
            .map_err(|_| StreamError::ConnectTimeout(self.config.connect_timeout))??;

            let subscription = serde_json::to_string(&self.subscription())?;
            ws.send(Message::Text(subscription)).await?;
            Ok::<_, StreamError>(ws)
        };
        let mut ws = tokio::select! {
            ws = connect => ws?,
            _ = stop_requested(shutdown) => {
                info!("Shutdown requested while connecting");
                return Ok(());
            }
        };
        self.set_state(IngestState::Subscribed);
        info!("Subscribed to {} messages", POSITION_REPORT);
        backoff.reset();

        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_frame(text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => self.on_frame(&bytes),
                    Some(Ok(Message::Close(close))) => {
                        info!("Upstream closed connection: {:?}", close);
                        return Err(StreamError::Closed);
                    }
                    // pings are answered by tungstenite itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(StreamError::Closed),
                },
                _ = stop_requested(shutdown) => {
                    info!("Closing upstream connection");
                    if let Err(e) = ws.close(None).await {
                        debug!("Close handshake failed: {}", e);
                    }
                    return Ok(());
                }
            }
        }
    }

    fn on_frame(&self, payload: &[u8]) {
        if *self.state.borrow() != IngestState::Streaming {
            self.set_state(IngestState::Streaming);
        }
        // a bad frame never ends the session
        let _ = self.handle_payload(payload);
    }

    /// Decode one frame and append the resulting update to the buffer.
    pub fn handle_payload(&self, payload: &[u8]) -> Result<(), DecodeError> {
        IngestStats::incr(&self.stats.messages_received);

        let update = StreamFrame::parse(payload).and_then(|frame| frame.into_update(Utc::now()));
        match update {
            Ok(update) => {
                IngestStats::incr(&self.stats.position_reports);
                self.buffer.push(update);
                Ok(())
            }
            Err(e) => {
                IngestStats::incr(&self.stats.decode_errors);
                match &e {
                    DecodeError::Json(_) => warn!("Failed to parse message: {}", e),
                    _ => debug!("Dropped message: {}", e),
                }
                Err(e)
            }
        }
    }

    fn subscription(&self) -> Subscription<'_> {
        let bounding_boxes = if self.config.bounding_boxes.is_empty() {
            vec![WHOLE_WORLD]
        } else {
            self.config.bounding_boxes.clone()
        };
        Subscription {
            api_key: &self.config.api_key,
            bounding_boxes,
            filter_message_types: [POSITION_REPORT],
        }
    }
}

/// Resolves once shutdown is signalled or its sender is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
