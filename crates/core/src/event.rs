use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Voice,
    Audio,
    Image,
    Document,
}

#[derive(Debug, Clone)]
pub enum InboundKind {
    Text {
        text: String,
    },
    Media {
        kind: MediaKind,
        path: PathBuf,
        caption: Option<String>,
    },
}

/// One ingress event from the messaging transport.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub chat_id: i64,
    pub topic_id: Option<i64>,
    pub user_id: i64,
    pub kind: InboundKind,
    pub timestamp_ms: i64,
}

impl InboundEvent {
    pub fn text(chat_id: i64, topic_id: Option<i64>, user_id: i64, text: &str) -> Self {
        Self {
            chat_id,
            topic_id,
            user_id,
            kind: InboundKind::Text {
                text: text.to_string(),
            },
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Text(String),
    Image(PathBuf),
    Document(PathBuf),
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub topic_id: Option<i64>,
    pub payload: OutboundPayload,
}

impl OutboundMessage {
    pub fn text(chat_id: i64, topic_id: Option<i64>, text: &str) -> Self {
        Self {
            chat_id,
            topic_id,
            payload: OutboundPayload::Text(text.to_string()),
        }
    }
}
