//! Assistant reply payloads.
//!
//! Replies arrive in several shapes depending on whether they come from the
//! event stream or inline in an HTTP response:
//!
//! - a bare JSON string
//! - `{"text": "..."}`
//! - `{"content": "..."}` (or `content` holding a list of parts)
//! - `{"parts": [{"type": "text", "text": "..."}, ...]}`
//!
//! [`AssistantMessage::from_value`] classifies the shape once at the boundary;
//! anything unrecognised becomes [`MessageBody::Empty`] instead of an error.

use serde_json::Value;

/// Keys that may carry the assistant session identifier.
const SESSION_KEYS: &[&str] = &["sessionID", "sessionId", "session_id"];

/// The body of an assistant reply, by shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// A bare JSON string.
    Plain(String),
    /// `{"text": ...}`
    Text(String),
    /// `{"content": "..."}`
    Content(String),
    /// `{"parts": [...]}` or `{"content": [...]}`
    Parts(Vec<Part>),
    /// Nothing deliverable.
    Empty,
}

/// One typed part of a multi-part reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub kind: String,
    pub text: Option<String>,
}

impl Part {
    fn from_value(value: &Value) -> Self {
        Self {
            kind: value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            text: value.get("text").and_then(Value::as_str).map(str::to_string),
        }
    }
}

impl MessageBody {
    /// Text to deliver. Parts contribute only when typed `text`, in order.
    pub fn text(&self) -> String {
        match self {
            MessageBody::Plain(text) | MessageBody::Text(text) | MessageBody::Content(text) => {
                text.clone()
            }
            MessageBody::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect(),
            MessageBody::Empty => String::new(),
        }
    }
}

/// An assistant reply together with the session it belongs to, if known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    pub session_id: Option<String>,
    pub body: MessageBody,
}

impl AssistantMessage {
    pub fn new(session_id: Option<String>, body: MessageBody) -> Self {
        Self { session_id, body }
    }

    pub fn from_value(value: &Value) -> Self {
        Self {
            session_id: find_session_id(value),
            body: classify(value),
        }
    }

    pub fn text(&self) -> String {
        self.body.text()
    }
}

fn classify(value: &Value) -> MessageBody {
    match value {
        Value::String(text) => MessageBody::Plain(text.clone()),
        Value::Object(map) => {
            if let Some(Value::Array(parts)) = map.get("parts") {
                return MessageBody::Parts(parts.iter().map(Part::from_value).collect());
            }
            if let Some(Value::String(text)) = map.get("text") {
                return MessageBody::Text(text.clone());
            }
            match map.get("content") {
                Some(Value::String(text)) => return MessageBody::Content(text.clone()),
                Some(Value::Array(parts)) => {
                    return MessageBody::Parts(parts.iter().map(Part::from_value).collect());
                }
                _ => {}
            }
            // Event envelopes wrap the payload: {"type": ..., "properties": {...}}
            match map.get("properties") {
                Some(inner @ Value::Object(_)) => classify(inner),
                _ => MessageBody::Empty,
            }
        }
        _ => MessageBody::Empty,
    }
}

fn find_session_id(value: &Value) -> Option<String> {
    let map = value.as_object()?;

    for key in SESSION_KEYS {
        if let Some(Value::String(id)) = map.get(*key) {
            return Some(id.clone());
        }
    }

    ["info", "properties"]
        .iter()
        .filter_map(|key| map.get(*key))
        .find_map(find_session_id)
        .or_else(|| {
            map.get("parts")
                .and_then(Value::as_array)
                .and_then(|parts| parts.iter().find_map(find_session_id))
        })
}
