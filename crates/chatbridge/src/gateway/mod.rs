//! Chat gateway integration.
//!
//! A gateway owns the chat-platform connection: authentication, receiving
//! messages addressed to the bot, and sending replies. The bridge treats it
//! as a black box behind the [`ChatGateway`] trait.
//!
//! The shipped implementation, [`SubprocessGateway`], runs an external
//! gateway program and talks to it with the JSON Lines protocol defined in
//! `chatbridge-gateway-protocol`:
//!
//! ```text
//!  chatbridge                          gateway process
//!      │  {"type":"start",...}  stdin       │
//!      │ ─────────────────────────────────▶ │ ── platform SDK ──▶ chat platform
//!      │  {"type":"connected"}  stdout      │
//!      │ ◀───────────────────────────────── │
//!      │  {"type":"message_received",...}   │
//!      │ ◀───────────────────────────────── │
//! ```

pub mod subprocess;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

// Re-export protocol types from the protocol crate
pub use chatbridge_gateway_protocol::{
    GatewayCommand, GatewayEvent, MessageReceivedData, PROTOCOL_VERSION, error_codes,
};

pub use subprocess::SubprocessGateway;

/// Platform credentials passed to [`ChatGateway::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCredentials {
    pub app_id: String,
    pub app_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("failed to spawn gateway: {0}")]
    SpawnFailed(String),

    #[error("gateway did not connect within {0:?}")]
    StartupTimeout(Duration),

    #[error("gateway authentication failed: {0}")]
    AuthFailed(String),

    #[error("gateway reported fatal error ({code}): {message}")]
    Fatal { code: String, message: String },

    #[error("gateway is not running")]
    NotRunning,

    #[error("gateway send failed ({code}): {message}")]
    SendFailed { code: String, message: String },

    #[error("gateway exited: {0}")]
    Exited(String),

    #[error("gateway i/o error: {0}")]
    Io(String),
}

/// Capabilities the bridge needs from a chat platform client.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Connect to the platform. Resolves once the connection is established.
    async fn start(&self, credentials: &GatewayCredentials) -> Result<(), GatewayError>;

    /// Disconnect. Idempotent.
    async fn stop(&self) -> Result<(), GatewayError>;

    /// Deliver text to a chat.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), GatewayError>;

    fn is_connected(&self) -> bool;

    /// Subscribe to platform events (messages, connection changes, errors).
    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;
}
