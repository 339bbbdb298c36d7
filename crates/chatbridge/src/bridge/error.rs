//! Bridge engine error types.

use thiserror::Error;

use crate::assistant::AssistantError;
use crate::gateway::GatewayError;

/// Errors returned by [`BridgeEngine::start`](super::BridgeEngine::start).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Required settings are missing or out of range.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// The bridge is already connecting or connected.
    #[error("bridge is already running")]
    AlreadyRunning,

    /// Something is already listening on the assistant's port.
    #[error("port {host}:{port} is already in use")]
    PortInUse { host: String, port: u16 },

    #[error(transparent)]
    Assistant(#[from] AssistantError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Both leaves started but one of them does not report connected.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// `stop()` was called while `start()` was in progress.
    #[error("start aborted by stop")]
    Aborted,

    /// The engine's dispatcher is gone.
    #[error("bridge engine has shut down")]
    Shutdown,
}

impl BridgeError {
    /// Short machine-readable code, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::ConfigInvalid(_) => "config_invalid",
            BridgeError::AlreadyRunning => "already_running",
            BridgeError::PortInUse { .. } => "port_in_use",
            BridgeError::Assistant(AssistantError::StartupTimeout(_)) => "startup_timeout",
            BridgeError::Assistant(AssistantError::SpawnFailed(_)) => "spawn_failed",
            BridgeError::Assistant(AssistantError::StreamDisconnected(_)) => "stream_disconnected",
            BridgeError::Assistant(AssistantError::ProcessCrashed(_)) => "process_crashed",
            BridgeError::Assistant(_) => "assistant_error",
            BridgeError::Gateway(_) => "gateway_error",
            BridgeError::NotConnected(_) => "not_connected",
            BridgeError::Aborted => "aborted",
            BridgeError::Shutdown => "shutdown",
        }
    }
}
