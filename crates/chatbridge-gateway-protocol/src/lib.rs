//! Gateway protocol types for chatbridge.
//!
//! A gateway connects chatbridge to a chat platform. Built-in gateways exchange
//! these types over Rust channels; external gateways run as a subprocess and
//! exchange them as JSON Lines (one JSON object per line) over stdio:
//!
//! - [`GatewayCommand`]: chatbridge → gateway, written to the gateway's stdin
//! - [`GatewayEvent`]: gateway → chatbridge, read from the gateway's stdout
//!
//! Both enums are internally tagged with a `type` field in `snake_case`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: &str = "1";

// ============================================================================
// Commands (chatbridge → gateway)
// ============================================================================

/// Commands sent from chatbridge to a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Authenticate against the platform and begin receiving messages.
    Start { app_id: String, app_secret: String },

    /// Deliver a text message to a chat.
    SendMessage {
        request_id: String,
        chat_id: String,
        text: String,
    },

    /// Disconnect from the platform and exit.
    Shutdown,
}

// ============================================================================
// Events (gateway → chatbridge)
// ============================================================================

/// Events emitted by a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// The gateway process is up and ready to accept commands.
    Ready {
        gateway: String,
        #[serde(default)]
        protocol_version: Option<String>,
    },

    /// The platform connection is established.
    Connected,

    /// The platform connection was lost.
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },

    /// A chat message was received from the platform.
    MessageReceived(MessageReceivedData),

    /// A command identified by `request_id` completed.
    CommandOk { request_id: String },

    /// A command identified by `request_id` failed.
    CommandFailed {
        request_id: String,
        code: String,
        message: String,
    },

    /// A gateway-level error not tied to a command.
    Error {
        code: String,
        message: String,
        #[serde(default)]
        fatal: bool,
    },
}

/// Payload of [`GatewayEvent::MessageReceived`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReceivedData {
    /// Platform-side conversation handle.
    pub chat_id: String,
    /// Platform message identifier, used for deduplication.
    pub message_id: String,
    /// Sender identifier.
    pub user_id: String,
    /// Plain-text message body.
    pub text: String,
    /// Whether the bot was mentioned.
    #[serde(default)]
    pub is_mentioned: bool,
    /// When the platform received the message.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Well-known error codes carried in [`GatewayEvent::Error`] and
/// [`GatewayEvent::CommandFailed`].
pub mod error_codes {
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const CHAT_NOT_FOUND: &str = "chat_not_found";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const SEND_FAILED: &str = "send_failed";
    pub const INVALID_COMMAND: &str = "invalid_command";
    pub const INTERNAL: &str = "internal";
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_command_wire_shape() {
        let cmd = GatewayCommand::SendMessage {
            request_id: "r1".to_string(),
            chat_id: "c1".to_string(),
            text: "hello".to_string(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "send_message");
        assert_eq!(json["chat_id"], "c1");
        assert_eq!(json["text"], "hello");
    }

    #[test]
    fn shutdown_command_is_bare_tag() {
        let json = serde_json::to_string(&GatewayCommand::Shutdown).unwrap();
        assert_eq!(json, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn message_received_parses_with_defaults() {
        let line = r#"{"type":"message_received","chat_id":"c1","message_id":"m1","user_id":"u1","text":"hi"}"#;
        let event: GatewayEvent = serde_json::from_str(line).unwrap();
        match event {
            GatewayEvent::MessageReceived(data) => {
                assert_eq!(data.chat_id, "c1");
                assert_eq!(data.message_id, "m1");
                assert!(!data.is_mentioned);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn disconnected_reason_is_optional() {
        let event: GatewayEvent = serde_json::from_str(r#"{"type":"disconnected"}"#).unwrap();
        assert_eq!(event, GatewayEvent::Disconnected { reason: None });
    }

    #[test]
    fn error_fatal_defaults_to_false() {
        let event: GatewayEvent =
            serde_json::from_str(r#"{"type":"error","code":"internal","message":"boom"}"#).unwrap();
        assert_eq!(
            event,
            GatewayEvent::Error {
                code: error_codes::INTERNAL.to_string(),
                message: "boom".to_string(),
                fatal: false,
            }
        );
    }
}
