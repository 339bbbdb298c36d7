//! Chat id ↔ assistant session id routing table.

use std::collections::HashMap;

/// One-to-one map from chat id to session id that remembers creation order.
#[derive(Debug, Default)]
pub struct ChatSessionMap {
    by_chat: HashMap<String, String>,
    /// Chat ids in the order their mapping was created.
    order: Vec<String>,
}

impl ChatSessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_for(&self, chat_id: &str) -> Option<&str> {
        self.by_chat.get(chat_id).map(String::as_str)
    }

    /// Record the session for `chat_id`. An existing mapping is kept.
    ///
    /// Returns the session id now mapped to the chat.
    pub fn insert(&mut self, chat_id: &str, session_id: &str) -> &str {
        if !self.by_chat.contains_key(chat_id) {
            self.order.push(chat_id.to_string());
        }
        self.by_chat
            .entry(chat_id.to_string())
            .or_insert_with(|| session_id.to_string())
            .as_str()
    }

    /// Reverse lookup: which chat owns `session_id`.
    pub fn chat_for_session(&self, session_id: &str) -> Option<&str> {
        self.by_chat
            .iter()
            .find(|(_, session)| session.as_str() == session_id)
            .map(|(chat, _)| chat.as_str())
    }

    /// The chat whose mapping was created last.
    pub fn most_recent_chat(&self) -> Option<&str> {
        self.order.last().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.by_chat.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.by_chat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_chat.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_first_session() {
        let mut map = ChatSessionMap::new();
        assert_eq!(map.insert("c1", "ses_1"), "ses_1");
        assert_eq!(map.insert("c1", "ses_2"), "ses_1");
        assert_eq!(map.len(), 1);
        assert_eq!(map.session_for("c1"), Some("ses_1"));
    }

    #[test]
    fn reverse_lookup_and_most_recent() {
        let mut map = ChatSessionMap::new();
        assert_eq!(map.most_recent_chat(), None);

        map.insert("c1", "ses_1");
        map.insert("c2", "ses_2");

        assert_eq!(map.chat_for_session("ses_1"), Some("c1"));
        assert_eq!(map.chat_for_session("ses_x"), None);
        assert_eq!(map.most_recent_chat(), Some("c2"));
    }

    #[test]
    fn clear_empties_map() {
        let mut map = ChatSessionMap::new();
        map.insert("c1", "ses_1");
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.most_recent_chat(), None);
    }
}
