use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::interaction::{Direction, InteractionEvent, InteractionKind};

/// Directed pairwise interaction counters. One row per unordered pair; the
/// (user_a, user_b) orientation is whatever the first write used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DirectedEdge {
    pub guild_id: String,
    pub user_a: String,
    pub user_b: String,
    pub last_interaction: DateTime<Utc>,
    pub msg_a_to_b: i64,
    pub msg_b_to_a: i64,
    pub mentions: i64,
    pub replies: i64,
    pub reactions: i64,
    pub rolling_7d: i64,
    pub rolling_30d: i64,
    pub total: i64,
}

impl DirectedEdge {
    /// Zero-counter row oriented from the event's sender.
    pub fn empty_for(event: &InteractionEvent) -> Self {
        Self {
            guild_id: event.guild_id.clone(),
            user_a: event.from_user.clone(),
            user_b: event.to_user.clone(),
            last_interaction: event.timestamp,
            msg_a_to_b: 0,
            msg_b_to_a: 0,
            mentions: 0,
            replies: 0,
            reactions: 0,
            rolling_7d: 0,
            rolling_30d: 0,
            total: 0,
        }
    }

    /// Apply one increment. Mirrors the upsert in the PostgreSQL store.
    pub fn apply(&mut self, event: &InteractionEvent) {
        match event.kind {
            InteractionKind::Message => match Direction::resolve(&self.user_a, &event.from_user) {
                Direction::AToB => self.msg_a_to_b += 1,
                Direction::BToA => self.msg_b_to_a += 1,
            },
            InteractionKind::Mention => self.mentions += 1,
            InteractionKind::Reply => self.replies += 1,
            InteractionKind::Reaction => self.reactions += 1,
        }
        self.total += 1;
        if event.timestamp > self.last_interaction {
            self.last_interaction = event.timestamp;
        }
    }

    pub fn touches(&self, user_id: &str) -> bool {
        self.user_a == user_id || self.user_b == user_id
    }

    pub fn connects(&self, x: &str, y: &str) -> bool {
        (self.user_a == x && self.user_b == y) || (self.user_a == y && self.user_b == x)
    }

    /// The neighbor on the other end, if `user_id` is one of the endpoints.
    pub fn other(&self, user_id: &str) -> Option<&str> {
        if self.user_a == user_id {
            Some(&self.user_b)
        } else if self.user_b == user_id {
            Some(&self.user_a)
        } else {
            None
        }
    }
}
