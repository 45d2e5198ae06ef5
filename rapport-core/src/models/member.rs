use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Member {
    pub guild_id: String,
    pub user_id: String,
    pub display_name: Option<String>,
    pub is_bot: bool,
}

/// One neighbor inside a member's persisted relationship network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRelationshipEntry {
    pub user_id: String,
    pub affinity_percentage: u8,
    pub interaction_count: i64,
    pub last_interaction: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emojis: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversations: Option<Vec<Uuid>>,
}

impl MemberRelationshipEntry {
    pub fn new(
        user_id: impl Into<String>,
        affinity_percentage: u8,
        interaction_count: i64,
        last_interaction: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            affinity_percentage: affinity_percentage.min(100),
            interaction_count,
            last_interaction,
            summary: None,
            keywords: None,
            emojis: None,
            notes: None,
            conversations: None,
        }
    }
}
