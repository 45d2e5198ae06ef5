use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RapportError;
use crate::models::{IncomingMessage, IncomingReaction, Member};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RapportRequest {
    Ping,
    Health,
    UpsertMember {
        member: Member,
    },
    RecordMessage {
        message: IncomingMessage,
    },
    RecordReaction {
        reaction: IncomingReaction,
    },
    TopRelationships {
        guild_id: String,
        user_id: String,
        limit: Option<u32>,
    },
    RelationshipBetween {
        guild_id: String,
        user_a: String,
        user_b: String,
    },
    MutualConnections {
        guild_id: String,
        user_a: String,
        user_b: String,
    },
    AnalyzeRelationship {
        guild_id: String,
        user_a: String,
        user_b: String,
    },
    RelationshipContext {
        guild_id: String,
        user_id: String,
        limit: Option<u32>,
    },
    /// Single member when `user_id` is set, otherwise the whole guild
    Rollup {
        guild_id: String,
        user_id: Option<String>,
    },
    /// Rebuild segments from the message log for every known pair
    Backfill {
        guild_id: String,
    },
    Maintain {
        guild_id: String,
    },
    PurgeGuild {
        guild_id: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RapportResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: String,
}

impl RapportResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// MessagePack payload for one length-delimited frame (named fields).
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, RapportError> {
    rmp_serde::to_vec_named(value).map_err(|e| RapportError::Ipc(e.to_string()))
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RapportError> {
    rmp_serde::from_slice(bytes).map_err(|e| RapportError::Ipc(e.to_string()))
}
