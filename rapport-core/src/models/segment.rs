use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::ChatMessage;

/// Namespace for deterministic backfill segment ids.
const SEGMENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a57_93d4_4e0b_a8c1_5be2_7d40_91aa);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentFeatures {
    pub duration_minutes: f64,
    pub has_mentions: bool,
    pub has_name_usage: bool,
}

/// A clustered run of temporally-close messages in one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversationSegment {
    pub id: Uuid,
    pub guild_id: String,
    pub channel_id: String,
    /// Sorted, de-duplicated
    pub participants: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub message_ids: Vec<String>,
    pub message_count: i32,
    #[sqlx(json)]
    pub features: SegmentFeatures,
    pub summary: Option<String>,
}

impl ConversationSegment {
    pub fn stable_id(guild_id: &str, channel_id: &str, first_message_id: &str) -> Uuid {
        let key = format!("{}:{}:{}", guild_id, channel_id, first_message_id);
        Uuid::new_v5(&SEGMENT_NAMESPACE, key.as_bytes())
    }

    pub fn duration_minutes(&self) -> f64 {
        (self.end_time - self.start_time).num_seconds() as f64 / 60.0
    }

    /// Recompute derived fields after a merge or filter.
    pub fn refresh_derived(&mut self) {
        self.participants.sort();
        self.participants.dedup();
        self.message_count = self.message_ids.len() as i32;
        self.features.duration_minutes = self.duration_minutes();
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    pub fn shares_participant(&self, other: &ConversationSegment) -> bool {
        self.participants.iter().any(|p| other.has_participant(p))
    }

    /// Distance in minutes between two segments; 0 when they overlap.
    pub fn gap_minutes(&self, other: &ConversationSegment) -> f64 {
        if self.start_time <= other.end_time && other.start_time <= self.end_time {
            return 0.0;
        }
        let a = (other.start_time - self.end_time).num_seconds().abs();
        let b = (other.end_time - self.start_time).num_seconds().abs();
        a.min(b) as f64 / 60.0
    }

    /// Fold `other` into `self`: union participants and messages, widen the span.
    ///
    /// Message ids of whichever segment started first come first. Overlapping
    /// segments can still interleave; `order_messages` fixes that when the
    /// message rows are at hand.
    pub fn absorb(&mut self, other: &ConversationSegment) {
        for p in &other.participants {
            if !self.has_participant(p) {
                self.participants.push(p.clone());
            }
        }
        let (earlier, later) = if (other.start_time, other.id) < (self.start_time, self.id) {
            (&other.message_ids, &self.message_ids)
        } else {
            (&self.message_ids, &other.message_ids)
        };
        let mut ids: Vec<String> = Vec::with_capacity(earlier.len() + later.len());
        for m in earlier.iter().chain(later.iter()) {
            if !ids.contains(m) {
                ids.push(m.clone());
            }
        }
        self.message_ids = ids;
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);
        self.features.has_mentions |= other.features.has_mentions;
        self.features.has_name_usage |= other.features.has_name_usage;
        if self.summary.is_none() {
            self.summary = other.summary.clone();
        }
        self.refresh_derived();
    }

    /// Sort message ids by (created_at, id) using the given rows. Ids without
    /// a row keep their relative order after the known ones.
    pub fn order_messages(&mut self, messages: &[ChatMessage]) {
        let key = |id: &String| {
            messages
                .iter()
                .find(|m| &m.id == id)
                .map(|m| (m.created_at, m.id.clone()))
        };
        self.message_ids.sort_by(|a, b| match (key(a), key(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }
}
