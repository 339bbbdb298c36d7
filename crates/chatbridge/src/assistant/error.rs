//! Assistant client error types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the assistant process client.
///
/// Synchronous failures are returned from the call that caused them.
/// `StreamDisconnected` and `ProcessCrashed` are also carried by
/// [`super::AssistantEvent::Disconnected`] when liveness is lost in the background.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssistantError {
    /// The assistant binary could not be spawned.
    #[error("failed to spawn assistant: {0}")]
    SpawnFailed(String),

    /// The health endpoint did not answer within the startup timeout.
    #[error("assistant did not become healthy within {0:?}")]
    StartupTimeout(Duration),

    /// `POST /session` failed.
    #[error("session creation failed: {0}")]
    SessionCreateFailed(String),

    /// `POST /session/{id}/message` failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The event stream could not be opened, or closed unexpectedly.
    #[error("event stream disconnected: {0}")]
    StreamDisconnected(String),

    /// The process exited or stopped answering health checks.
    #[error("assistant process crashed: {0}")]
    ProcessCrashed(String),

    /// An operation needing a running process was called while stopped.
    #[error("assistant is not running")]
    NotRunning,

    /// `stop()` was called while `start()` was still waiting.
    #[error("assistant startup aborted")]
    Aborted,
}
