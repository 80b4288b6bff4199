//! Outbound event channel abstraction.
//!
//! The pipeline emits protocol events through this trait rather than writing
//! to the socket directly, so tests can capture the exact event sequence a
//! turn produces.

use super::protocol::ServerMessage;
use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, stream::SplitSink};
use std::sync::Arc;
use tokio::sync::Mutex;

/// The client's transport is gone or unusable. Nothing further may be sent
/// on the connection; the pipeline aborts silently instead of reporting an
/// `error` event nobody would receive.
#[derive(Debug, thiserror::Error)]
#[error("client transport closed: {0}")]
pub struct TransportClosed(pub String);

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Serializes and sends one protocol event.
    async fn send(&self, msg: ServerMessage) -> Result<()>;

    /// Sends one binary frame of PCM16 audio.
    async fn send_pcm(&self, pcm: Bytes) -> Result<()>;
}

/// The production sink: a shared handle to the WebSocket's send half. The
/// mutex keeps a phrase's `audio_start` / PCM / `audio_end` frames from
/// interleaving with handler acknowledgements mid-sequence only at the frame
/// level; event ordering within a turn is the pipeline's job.
pub struct WsEventSink {
    tx: Arc<Mutex<SplitSink<WebSocket, Message>>>,
}

impl WsEventSink {
    pub fn new(tx: Arc<Mutex<SplitSink<WebSocket, Message>>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for WsEventSink {
    async fn send(&self, msg: ServerMessage) -> Result<()> {
        let serialized = serde_json::to_string(&msg)?;
        self.tx
            .lock()
            .await
            .send(Message::Text(serialized.into()))
            .await
            .map_err(|e| TransportClosed(e.to_string()))?;
        Ok(())
    }

    async fn send_pcm(&self, pcm: Bytes) -> Result<()> {
        self.tx
            .lock()
            .await
            .send(Message::Binary(pcm))
            .await
            .map_err(|e| TransportClosed(e.to_string()))?;
        Ok(())
    }
}
