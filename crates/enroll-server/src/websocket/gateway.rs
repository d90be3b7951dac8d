//! Wire frames and the `WebSocket` side of the event pump.

use async_trait::async_trait;
use axum::extract::ws::Message;
use chrono::Utc;
use enroll_core::events::Event;
use enroll_runtime::gateway::{TransportError, TransportGateway};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Inbound client text frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Plain `ping` text.
    Ping,
    /// `{"type":"get_status"}`.
    GetStatus,
    /// Anything else.
    Unknown,
}

impl Inbound {
    /// Classify a text frame.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("ping") {
            return Self::Ping;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(v) if v["type"] == "get_status" => Self::GetStatus,
            Ok(v) if v["type"] == "ping" => Self::Ping,
            _ => Self::Unknown,
        }
    }
}

/// `{"type": <kind>, "timestamp": ..., "data": <data>}`.
pub fn frame(kind: &str, data: Value) -> String {
    json!({
        "type": kind,
        "timestamp": Utc::now().to_rfc3339(),
        "data": data,
    })
    .to_string()
}

/// The `status_update` frame carrying one event.
pub fn status_update(event: &Event) -> Result<String, serde_json::Error> {
    Ok(frame("status_update", serde_json::to_value(event)?))
}

/// Pushes events into a connection's outbound channel.
pub struct WsGateway {
    tx: mpsc::Sender<Message>,
}

impl WsGateway {
    /// Gateway writing to `tx`.
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Queue a raw frame. `false` once the writer is gone.
    pub async fn send(&self, message: Message) -> bool {
        self.tx.send(message).await.is_ok()
    }
}

#[async_trait]
impl TransportGateway for WsGateway {
    async fn push(&mut self, event: &Event) -> Result<(), TransportError> {
        let text = status_update(event).map_err(|e| TransportError::Disconnected(e.to_string()))?;
        self.tx
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::Disconnected("outbound channel closed".into()))
    }
}
