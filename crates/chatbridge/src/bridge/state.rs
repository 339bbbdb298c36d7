//! Bridge lifecycle state and the status snapshot published to readers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
}

impl BridgeState {
    /// Whether `start` must be rejected with `AlreadyRunning`.
    pub fn is_running(self) -> bool {
        matches!(self, BridgeState::Connecting | BridgeState::Connected)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgeState::Idle => "idle",
            BridgeState::Connecting => "connecting",
            BridgeState::Connected => "connected",
            BridgeState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the bridge.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BridgeStatus {
    pub state: BridgeState,
    pub last_error: Option<String>,
    pub gateway_connected: bool,
    pub assistant_connected: bool,
    pub retry_queue_depth: usize,
    pub active_sessions: usize,
    pub connected_since: Option<DateTime<Utc>>,
}
