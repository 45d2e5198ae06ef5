use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logged guild message, as read by the segmenter and hygiene passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatMessage {
    pub guild_id: String,
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub referenced_message_id: Option<String>,
    pub is_bot: bool,
}

/// Message event as delivered by the chat-platform client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub guild_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub author_id: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub referenced_message_id: Option<String>,
    /// Mentions resolved by the client; merged with markup found in `content`
    #[serde(default)]
    pub mention_ids: Vec<String>,
}

impl IncomingMessage {
    pub fn into_logged(self, is_bot: bool) -> ChatMessage {
        ChatMessage {
            guild_id: self.guild_id,
            id: self.message_id,
            channel_id: self.channel_id,
            author_id: self.author_id,
            content: self.content,
            created_at: self.created_at,
            referenced_message_id: self.referenced_message_id,
            is_bot,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingReaction {
    pub guild_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub reactor_id: String,
    pub created_at: DateTime<Utc>,
}
