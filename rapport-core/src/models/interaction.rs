use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RapportError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Message,
    Mention,
    Reply,
    Reaction,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Message => "message",
            InteractionKind::Mention => "mention",
            InteractionKind::Reply => "reply",
            InteractionKind::Reaction => "reaction",
        }
    }
}

/// Direction of an interaction relative to the stored edge orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    /// Resolve against an edge whose first-write orientation starts at `row_user_a`.
    pub fn resolve(row_user_a: &str, from_user: &str) -> Self {
        if row_user_a == from_user {
            Direction::AToB
        } else {
            Direction::BToA
        }
    }
}

/// A single counted interaction. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub guild_id: String,
    pub from_user: String,
    pub to_user: String,
    pub kind: InteractionKind,
    /// Relative to (from_user, to_user); the store re-resolves it against the
    /// row orientation when the edge already exists the other way round.
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
}

impl InteractionEvent {
    pub fn new(
        guild_id: impl Into<String>,
        from_user: impl Into<String>,
        to_user: impl Into<String>,
        kind: InteractionKind,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let from_user = from_user.into();
        let to_user = to_user.into();
        if from_user.is_empty() || to_user.is_empty() {
            return Err(RapportError::InvalidPair("empty participant id".to_string()));
        }
        if from_user == to_user {
            return Err(RapportError::InvalidPair(format!(
                "self-interaction for {}",
                from_user
            )));
        }
        Ok(Self {
            guild_id: guild_id.into(),
            from_user,
            to_user,
            kind,
            direction: Direction::AToB,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_self_interaction() {
        let err = InteractionEvent::new("g", "a", "a", InteractionKind::Message, Utc::now());
        assert!(matches!(err, Err(RapportError::InvalidPair(_))));
    }

    #[test]
    fn test_rejects_empty_ids() {
        let err = InteractionEvent::new("g", "", "b", InteractionKind::Reply, Utc::now());
        assert!(matches!(err, Err(RapportError::InvalidPair(_))));
    }

    #[test]
    fn test_direction_resolution() {
        assert_eq!(Direction::resolve("a", "a"), Direction::AToB);
        assert_eq!(Direction::resolve("a", "b"), Direction::BToA);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let v = serde_json::to_value(InteractionKind::Reaction).unwrap();
        assert_eq!(v, serde_json::json!("reaction"));
    }
}
