//! chatbridge - Bridge between a chat platform and a locally supervised AI assistant.

// ============================================================================
// Always Available
// ============================================================================

pub mod assistant;
pub mod bridge;
pub mod config;
pub mod gateway;
pub mod sse_parser;

// ============================================================================
// Server-only (behind `server` feature)
// ============================================================================

#[cfg(feature = "server")]
pub mod handlers;
#[cfg(feature = "server")]
pub mod response;
#[cfg(feature = "server")]
pub mod server;
