use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform-stable integer id of a conversation: a Discord channel snowflake
/// or a Telegram chat id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(i64);

impl ConversationId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for ConversationId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message in a conversation, platform-neutral. Compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub content: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub conversation_id: ConversationId,
    pub message_id: i64,
    #[serde(default)]
    pub is_bot: bool,
}

impl ConversationRecord {
    /// Record synthesized for one of the bot's own replies. Carries no
    /// platform message id.
    pub fn bot(
        author: impl Into<String>,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            author: author.into(),
            timestamp: Utc::now(),
            conversation_id,
            message_id: 0,
            is_bot: true,
        }
    }
}

/// Envelope an adapter pushes to the gateway: the record plus the routing
/// facts the reply path needs.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Adapter id, e.g. "telegram" or "discord".
    pub channel_id: String,
    pub record: ConversationRecord,
    pub is_group: bool,
    /// Platform handle of the sender, used for group-reply mentions where the
    /// platform supports it.
    pub sender_handle: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub content: String,
    /// Platform message to quote, where the platform supports it.
    pub reply_to_message_id: Option<i64>,
    /// Handle to prepend in group contexts; applying it is adapter policy.
    pub mention: Option<String>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reply_to_message_id: None,
            mention: None,
        }
    }
}
