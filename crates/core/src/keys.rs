use std::fmt;

/// Canonical sentinel used when a message arrives outside any forum topic.
pub const ROOT_TOPIC: &str = "root";

/// Serialization key for the per-conversation queue and rate limiting:
/// `chatId:topicId` with the root sentinel for missing topics.
pub fn topic_key(chat_id: i64, topic_id: Option<i64>) -> String {
    match topic_id {
        Some(t) => format!("{}:{}", chat_id, t),
        None => format!("{}:{}", chat_id, ROOT_TOPIC),
    }
}

/// Scoping key for sessions and memory: `chatId:topicId:agentId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadKey {
    pub chat_id: i64,
    pub topic_id: String,
    pub agent_id: String,
}

impl ThreadKey {
    pub fn new(chat_id: i64, topic_id: Option<i64>, agent_id: &str) -> Self {
        Self {
            chat_id,
            topic_id: topic_id
                .map(|t| t.to_string())
                .unwrap_or_else(|| ROOT_TOPIC.to_string()),
            agent_id: agent_id.to_string(),
        }
    }

    /// Parse a persisted `chat:topic:agent` key. Returns `None` for malformed
    /// keys, including legacy two-field `chat:topic` keys.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let chat_id = parts.next()?.parse::<i64>().ok()?;
        let topic_id = parts.next()?.to_string();
        let agent_id = parts.next()?.to_string();
        if topic_id.is_empty() || agent_id.is_empty() {
            return None;
        }
        Some(Self {
            chat_id,
            topic_id,
            agent_id,
        })
    }

    pub fn topic_key(&self) -> String {
        format!("{}:{}", self.chat_id, self.topic_id)
    }

    pub fn topic_id_num(&self) -> Option<i64> {
        if self.topic_id == ROOT_TOPIC {
            None
        } else {
            self.topic_id.parse().ok()
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chat_id, self.topic_id, self.agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_key_root_sentinel() {
        assert_eq!(topic_key(12345, None), "12345:root");
        assert_eq!(topic_key(12345, Some(7)), "12345:7");
    }

    #[test]
    fn test_thread_key_round_trip() {
        let key = ThreadKey::new(-100987, Some(42), "codex");
        assert_eq!(key.to_string(), "-100987:42:codex");
        let parsed = ThreadKey::parse("-100987:42:codex").unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.topic_key(), "-100987:42");
        assert_eq!(parsed.topic_id_num(), Some(42));
    }

    #[test]
    fn test_thread_key_rejects_legacy_two_field() {
        assert!(ThreadKey::parse("12345:root").is_none());
        assert!(ThreadKey::parse("garbage").is_none());
    }

    #[test]
    fn test_root_topic_has_no_numeric_id() {
        let key = ThreadKey::new(1, None, "claude");
        assert_eq!(key.topic_id, "root");
        assert_eq!(key.topic_id_num(), None);
    }
}
