//! Bounded retry queue for failed deliveries.

use std::collections::VecDeque;

use serde::Serialize;

/// Which leaf a pending message is headed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Chat text waiting to be sent into an assistant session.
    ToAssistant,
    /// Assistant reply waiting to be delivered to a chat.
    ToChat,
}

/// A delivery that failed and is waiting for another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub direction: Direction,
    /// Chat id (for `ToAssistant`, the originating chat) or destination chat
    /// (for `ToChat`). `None` means "resolve at retry time".
    pub target: Option<String>,
    pub text: String,
    pub retries: u32,
}

impl PendingMessage {
    pub fn to_assistant(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            direction: Direction::ToAssistant,
            target: Some(chat_id.into()),
            text: text.into(),
            retries: 0,
        }
    }

    pub fn to_chat(chat_id: Option<String>, text: impl Into<String>) -> Self {
        Self {
            direction: Direction::ToChat,
            target: chat_id,
            text: text.into(),
            retries: 0,
        }
    }
}

/// FIFO with a fixed capacity; pushing onto a full queue evicts the oldest entry.
#[derive(Debug)]
pub struct RetryQueue {
    entries: VecDeque<PendingMessage>,
    capacity: usize,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `message`, returning the entry evicted to make room, if any.
    pub fn push(&mut self, message: PendingMessage) -> Option<PendingMessage> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(message);
        evicted
    }

    /// Remove and return every entry, oldest first.
    pub fn drain_all(&mut self) -> Vec<PendingMessage> {
        self.entries.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
