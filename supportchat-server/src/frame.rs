//! JSON frames exchanged over chat WebSockets.
//!
//! Chat messages travel as a flat object
//! `{ id, chatId, sender, content, timestamp }`. Everything else is a
//! control frame tagged with `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::MessageRow;
use crate::error::ChatError;

/// A stored message as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrame {
    pub id: i64,
    pub chat_id: i64,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<MessageRow> for MessageFrame {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            chat_id: row.chat_id,
            sender: row.sender,
            content: row.content,
            timestamp: row.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlFrame {
    /// First frame on a customer connection.
    ChatAssigned {
        #[serde(rename = "chatId")]
        chat_id: i64,
    },
    /// The chat was closed; the server drops the connection next.
    ChatClosed {
        #[serde(rename = "chatId")]
        chat_id: i64,
    },
    Error { message: String },
}

/// Raw shape of a client frame. Unknown fields (`id`, `timestamp`) are
/// ignored; `sender` is always replaced server-side.
#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "chatId")]
    chat_id: Option<i64>,
    #[serde(default)]
    content: String,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message { chat_id: Option<i64>, content: String },
    /// Staff request to replay one chat's history.
    Join { chat_id: i64 },
    /// Decodable JSON we don't understand.
    Unknown(String),
}

/// Decode a client text frame. A JSON error is a protocol violation.
pub fn parse_inbound(text: &str) -> Result<Inbound, serde_json::Error> {
    let raw: RawInbound = serde_json::from_str(text)?;
    Ok(match (raw.kind.as_deref(), raw.chat_id) {
        (None | Some("message"), chat_id) => Inbound::Message { chat_id, content: raw.content },
        (Some("join"), Some(chat_id)) => Inbound::Join { chat_id },
        (Some(other), _) => Inbound::Unknown(other.to_string()),
    })
}

/// Outcome of checking message content that is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCheck {
    Accept,
    /// Empty or whitespace-only; dropped without a reply.
    Empty,
}

/// Check message content. Oversized content is an error.
pub fn validate_content(content: &str, max_len: usize) -> Result<ContentCheck, ChatError> {
    if content.trim().is_empty() {
        return Ok(ContentCheck::Empty);
    }
    if content.len() > max_len {
        return Err(ChatError::Validation("content too long"));
    }
    Ok(ContentCheck::Accept)
}

/// Serialize a frame to its wire text.
pub fn encode<T: Serialize>(frame: &T) -> String {
    // Frame types contain only strings, integers and timestamps.
    serde_json::to_string(frame).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_frame_wire_shape() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc);
        let frame = MessageFrame {
            id: 7,
            chat_id: 1,
            sender: "A".into(),
            content: "hello".into(),
            timestamp: ts,
        };
        let v: serde_json::Value = serde_json::from_str(&encode(&frame)).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["chatId"], 1);
        assert_eq!(v["sender"], "A");
        assert_eq!(v["content"], "hello");
        assert_eq!(v["timestamp"], "2024-05-01T10:00:00Z");
    }

    #[test]
    fn control_frame_wire_shape() {
        let v: serde_json::Value =
            serde_json::from_str(&encode(&ControlFrame::ChatAssigned { chat_id: 3 })).unwrap();
        assert_eq!(v, serde_json::json!({ "type": "chatAssigned", "chatId": 3 }));
        let v: serde_json::Value =
            serde_json::from_str(&encode(&ControlFrame::Error { message: "slow down".into() })).unwrap();
        assert_eq!(v, serde_json::json!({ "type": "error", "message": "slow down" }));
    }

    #[test]
    fn parses_plain_message() {
        let parsed = parse_inbound(r#"{"chatId": 1, "sender": "spoofed", "content": "hi"}"#).unwrap();
        assert_eq!(parsed, Inbound::Message { chat_id: Some(1), content: "hi".into() });
        let parsed = parse_inbound(r#"{"content": "hi"}"#).unwrap();
        assert_eq!(parsed, Inbound::Message { chat_id: None, content: "hi".into() });
    }

    #[test]
    fn parses_control_requests() {
        assert_eq!(parse_inbound(r#"{"type":"join","chatId":4}"#).unwrap(), Inbound::Join { chat_id: 4 });
        assert_eq!(parse_inbound(r#"{"type":"message","content":"x"}"#).unwrap(),
            Inbound::Message { chat_id: None, content: "x".into() });
        assert_eq!(
            parse_inbound(r#"{"type":"join"}"#).unwrap(),
            Inbound::Unknown("join".into())
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_inbound("not json").is_err());
        assert!(parse_inbound(r#"{"content": 5}"#).is_err());
    }

    #[test]
    fn content_validation() {
        assert_eq!(validate_content("hello", 10).unwrap(), ContentCheck::Accept);
        assert_eq!(validate_content("   \t\n", 10).unwrap(), ContentCheck::Empty);
        assert_eq!(validate_content("", 10).unwrap(), ContentCheck::Empty);
        assert!(matches!(validate_content("way too long", 4), Err(ChatError::Validation(_))));
        // Blank content is never "too long".
        assert_eq!(validate_content("          ", 4).unwrap(), ContentCheck::Empty);
    }
}
