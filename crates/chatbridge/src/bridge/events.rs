//! Subscriber registry for bridge events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Serialize;

use super::queue::Direction;
use super::state::BridgeStatus;

/// Something observable happened on the bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A message was routed (inbound to the assistant or outbound to a chat).
    Message {
        direction: Direction,
        chat_id: Option<String>,
        text: String,
    },
    /// The published status changed.
    StatusChange(BridgeStatus),
    /// A liveness loss or other non-fatal error.
    Error { message: String },
}

type Handler = Arc<dyn Fn(&BridgeEvent) + Send + Sync>;
type Handlers = DashMap<u64, Handler>;

/// Fan-out of [`BridgeEvent`]s to registered callbacks.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Handlers>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BridgeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.insert(id, Arc::new(handler));
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Deliver `event` to every handler registered at the time of the call.
    pub fn emit(&self, event: &BridgeEvent) {
        // Snapshot first so handlers may (un)subscribe without deadlocking the map
        let handlers: Vec<Handler> = self.handlers.iter().map(|h| h.value().clone()).collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Disposer for a registered handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    id: u64,
    handlers: Weak<Handlers>,
}

impl Subscription {
    /// Remove the handler now.
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            handlers.remove(&self.id);
        }
    }
}
