//! Bounded seen-sets for inbound message ids and outbound reply fingerprints.

use std::collections::{HashSet, VecDeque};

use sha2::{Digest, Sha256};

/// Set of recently seen keys; once full, each insert evicts the oldest key.
#[derive(Debug)]
pub struct SeenWindow {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `key`. Returns `false` if it was already in the window.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.set.contains(key) {
            return false;
        }
        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.set.remove(&oldest);
        }
        self.set.insert(key.to_string());
        self.order.push_back(key.to_string());
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    pub fn clear(&mut self) {
        self.set.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Fingerprint of an outbound reply: SHA-256 of its text.
///
/// The destination is not part of the key: copies of one turn that carry
/// different session hints collapse to a single delivery.
pub fn fingerprint(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}
