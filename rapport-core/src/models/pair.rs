use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RapportError, Result};

/// Order-normalized (min, max) key for an undirected pair.
pub fn ordered<'a>(x: &'a str, y: &'a str) -> Result<(&'a str, &'a str)> {
    if x == y {
        return Err(RapportError::InvalidPair(format!("self-pair for {}", x)));
    }
    Ok(if x < y { (x, y) } else { (y, x) })
}

/// Undirected read cache over an edge, plus the conversations that back it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UndirectedPair {
    pub guild_id: String,
    pub u_min: String,
    pub u_max: String,
    pub last_interaction: DateTime<Utc>,
    pub total_interactions: i64,
    pub segment_ids: Vec<Uuid>,
}

impl UndirectedPair {
    pub fn new(guild_id: &str, x: &str, y: &str, at: DateTime<Utc>) -> Result<Self> {
        let (u_min, u_max) = ordered(x, y)?;
        Ok(Self {
            guild_id: guild_id.to_string(),
            u_min: u_min.to_string(),
            u_max: u_max.to_string(),
            last_interaction: at,
            total_interactions: 0,
            segment_ids: Vec::new(),
        })
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        self.total_interactions += 1;
        if at > self.last_interaction {
            self.last_interaction = at;
        }
    }

    /// Move `segment_id` to the front, dropping duplicates and anything past `cap`.
    pub fn link_segment(&mut self, segment_id: Uuid, cap: usize) {
        self.segment_ids.retain(|id| *id != segment_id);
        self.segment_ids.insert(0, segment_id);
        self.segment_ids.truncate(cap);
    }

    pub fn other(&self, user_id: &str) -> Option<&str> {
        if self.u_min == user_id {
            Some(&self.u_max)
        } else if self.u_max == user_id {
            Some(&self.u_min)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_normalizes() {
        assert_eq!(ordered("b", "a").unwrap(), ("a", "b"));
        assert_eq!(ordered("a", "b").unwrap(), ("a", "b"));
        assert!(ordered("a", "a").is_err());
    }

    #[test]
    fn test_ordered_uses_byte_order() {
        // Uppercase sorts before lowercase regardless of locale
        assert_eq!(ordered("a", "B").unwrap(), ("B", "a"));
        assert_eq!(ordered("10", "9").unwrap(), ("10", "9"));
    }

    #[test]
    fn test_link_segment_bounded_and_deduped() {
        let mut pair = UndirectedPair::new("g", "y", "x", Utc::now()).unwrap();
        assert_eq!(pair.u_min, "x");

        let ids: Vec<Uuid> = (0..25).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            pair.link_segment(*id, 20);
        }
        assert_eq!(pair.segment_ids.len(), 20);
        assert_eq!(pair.segment_ids[0], ids[24]);

        // Re-linking an existing id moves it to the front without duplicating
        pair.link_segment(ids[10], 20);
        assert_eq!(pair.segment_ids[0], ids[10]);
        assert_eq!(pair.segment_ids.iter().filter(|id| **id == ids[10]).count(), 1);
        assert_eq!(pair.segment_ids.len(), 20);
    }
}
