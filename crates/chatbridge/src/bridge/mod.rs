//! Bridge engine: routes chat messages to assistant sessions and back.
//!
//! # Lifecycle
//!
//! ```text
//!   idle ──start()──▶ connecting ──both leaves up──▶ connected
//!    ▲                    │                              │
//!    │                    │ start failed                 │ either leaf lost
//!    │                    ▼                              ▼
//!    └────stop()──────── error ◀────────────────────────┘
//! ```
//!
//! There is no automatic way out of `error`; callers `stop()` and `start()`.
//!
//! # Routing
//!
//! - Inbound (chat → assistant): dedup by message id, then look up or lazily
//!   create the chat's session and send.
//! - Outbound (assistant → chat): extract text, dedup by fingerprint, reverse
//!   lookup the session's chat (falling back to the most recently mapped
//!   chat), then send.
//!
//! Failed deliveries go to a bounded retry queue drained on a fixed interval
//! while `connected`.

mod dedup;
mod dispatcher;
mod engine;
mod error;
mod events;
mod queue;
mod sessions;
mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use dedup::{SeenWindow, fingerprint};
pub use engine::BridgeEngine;
pub use error::BridgeError;
pub use events::{BridgeEvent, EventBus, Subscription};
pub use queue::{Direction, PendingMessage, RetryQueue};
pub use sessions::ChatSessionMap;
pub use state::{BridgeState, BridgeStatus};
