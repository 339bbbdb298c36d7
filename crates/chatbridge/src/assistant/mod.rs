//! Assistant process client.
//!
//! Supervises one locally spawned assistant process and speaks its HTTP +
//! server-sent-event protocol:
//!
//! | Endpoint                     | Use                               |
//! |------------------------------|-----------------------------------|
//! | `GET /health`                | startup wait and liveness polling |
//! | `POST /session`              | create a conversation             |
//! | `POST /session/{id}/message` | send user text                    |
//! | `GET /event`                 | long-lived event stream           |
//!
//! The client knows nothing about chat platforms. Everything it observes
//! asynchronously is published as an [`AssistantEvent`].

mod client;
mod error;
mod payload;
mod process;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

pub use client::AssistantProcessClient;
pub use error::AssistantError;
pub use payload::{AssistantMessage, MessageBody, Part};
pub use process::ProcessHandle;

use crate::config::AssistantConfig;
use crate::sse_parser::SseFrame;

/// Events published by an assistant client.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantEvent {
    /// The assistant reported an established connection.
    Connected,
    /// A reply, from the event stream or inline in a send response.
    Message(AssistantMessage),
    /// Liveness was lost (stream closed, health check failed, process exited).
    Disconnected(AssistantError),
    /// The assistant reported an error.
    Error(String),
    /// An event name this client does not interpret.
    Other { name: String, data: Value },
}

impl AssistantEvent {
    /// Map an event-stream frame to a typed event by its `event` name.
    pub fn from_frame(frame: &SseFrame) -> Self {
        let data = serde_json::from_str::<Value>(&frame.data)
            .unwrap_or_else(|_| Value::String(frame.data.clone()));

        match frame.event.as_str() {
            "connected" | "server.connected" => AssistantEvent::Connected,
            "message" => AssistantEvent::Message(AssistantMessage::from_value(&data)),
            "disconnected" => AssistantEvent::Disconnected(AssistantError::StreamDisconnected(
                "assistant reported disconnect".to_string(),
            )),
            "error" => AssistantEvent::Error(error_message(&data)),
            name => AssistantEvent::Other {
                name: name.to_string(),
                data,
            },
        }
    }
}

fn error_message(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string()),
        _ => data.to_string(),
    }
}

/// Capabilities the bridge needs from an assistant.
///
/// Implemented by [`AssistantProcessClient`]; tests substitute fakes.
#[async_trait]
pub trait AssistantClient: Send + Sync {
    /// Spawn the assistant and wait until it is healthy.
    async fn start(&self, config: &AssistantConfig) -> Result<(), AssistantError>;

    /// Stop the assistant. Idempotent.
    async fn stop(&self) -> Result<(), AssistantError>;

    /// Create a conversation and return its session id.
    async fn create_session(&self) -> Result<String, AssistantError>;

    /// Send user text into a session.
    async fn send_message(&self, session_id: &str, text: &str) -> Result<(), AssistantError>;

    /// Open the long-lived event stream.
    async fn open_event_stream(&self) -> Result<(), AssistantError>;

    /// Whether the process is healthy and the event stream is open.
    fn is_connected(&self) -> bool;

    /// Subscribe to published events.
    fn subscribe(&self) -> broadcast::Receiver<AssistantEvent>;
}
