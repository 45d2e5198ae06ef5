//! Query Façade: read-only views over networks, edges and segments
//!
//! Missing data is an answer, not an error: untracked users get empty lists,
//! `RelationshipLookup::NotFound` or `None`. Only a self-pair is rejected.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use rapport_core::affinity::{self, StrengthLabel};
use rapport_core::models::{pair, ConversationSegment, DirectedEdge, MemberRelationshipEntry};
use rapport_core::{RelationshipStore, Result};

pub const DEFAULT_LIMIT: u32 = 10;

// ============================================================================
// RESULT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RelationshipLookup {
    /// Present in the first user's own network
    Found { entry: MemberRelationshipEntry },
    /// Only the second user's network lists the first
    TrackedFromOtherSide { entry: MemberRelationshipEntry },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutualConnection {
    pub user_id: String,
    pub affinity_with_a: u8,
    pub affinity_with_b: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub channel_id: String,
    pub participants: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub message_count: i32,
    pub duration_minutes: f64,
}

impl From<&ConversationSegment> for ConversationSummary {
    fn from(s: &ConversationSegment) -> Self {
        Self {
            id: s.id,
            channel_id: s.channel_id.clone(),
            participants: s.participants.clone(),
            start_time: s.start_time,
            end_time: s.end_time,
            message_count: s.message_count,
            duration_minutes: s.features.duration_minutes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationshipAnalysis {
    pub user_a: String,
    pub user_b: String,
    /// Share of A's interaction volume (or B's, when only tracked from B's side)
    pub affinity_percentage: u8,
    pub strength: StrengthLabel,
    pub interaction_count: i64,
    pub last_interaction: Option<DateTime<Utc>>,
    /// Raw directed counters, when an edge exists
    pub edge: Option<DirectedEdge>,
    /// `min(100, ln(count + 1) * 25)`; diagnostic only
    pub log_score: f64,
    pub conversation_count: usize,
    pub total_messages: i64,
    pub average_duration_minutes: f64,
    pub most_recent_conversation: Option<ConversationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextEntry {
    pub user_id: String,
    pub display_name: Option<String>,
    pub affinity_percentage: u8,
    pub strength: StrengthLabel,
    pub interaction_count: i64,
    pub last_interaction: DateTime<Utc>,
    pub pair_total_interactions: Option<i64>,
    pub recent_conversation: Option<ConversationSummary>,
}

/// Typed relationship projection for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationshipContext {
    pub guild_id: String,
    pub user_id: String,
    pub display_name: Option<String>,
    pub relationships: Vec<ContextEntry>,
}

// ============================================================================
// PUBLIC API
// ============================================================================

/// The member's persisted network, already ranked, truncated to `limit`.
pub async fn top_relationships(
    store: &dyn RelationshipStore,
    guild_id: &str,
    user_id: &str,
    limit: u32,
) -> Result<Vec<MemberRelationshipEntry>> {
    let mut network = network_or_empty(store, guild_id, user_id).await?;
    network.truncate(limit as usize);
    Ok(network)
}

pub async fn relationship_between(
    store: &dyn RelationshipStore,
    guild_id: &str,
    user_a: &str,
    user_b: &str,
) -> Result<RelationshipLookup> {
    pair::ordered(user_a, user_b)?;

    let own = network_or_empty(store, guild_id, user_a).await?;
    if let Some(entry) = own.into_iter().find(|e| e.user_id == user_b) {
        return Ok(RelationshipLookup::Found { entry });
    }

    let theirs = network_or_empty(store, guild_id, user_b).await?;
    Ok(match theirs.into_iter().find(|e| e.user_id == user_a) {
        Some(entry) => RelationshipLookup::TrackedFromOtherSide { entry },
        None => RelationshipLookup::NotFound,
    })
}

/// Shared neighbors of A and B with both affinities, strongest combined first.
pub async fn mutual_connections(
    store: &dyn RelationshipStore,
    guild_id: &str,
    user_a: &str,
    user_b: &str,
) -> Result<Vec<MutualConnection>> {
    pair::ordered(user_a, user_b)?;

    let network_a = network_or_empty(store, guild_id, user_a).await?;
    let network_b: HashMap<String, u8> = network_or_empty(store, guild_id, user_b)
        .await?
        .into_iter()
        .map(|e| (e.user_id, e.affinity_percentage))
        .collect();

    let mut mutual: Vec<MutualConnection> = network_a
        .into_iter()
        .filter(|e| e.user_id != user_a && e.user_id != user_b)
        .filter_map(|e| {
            network_b.get(&e.user_id).map(|with_b| MutualConnection {
                user_id: e.user_id.clone(),
                affinity_with_a: e.affinity_percentage,
                affinity_with_b: *with_b,
            })
        })
        .collect();

    mutual.sort_by(|x, y| {
        let cx = x.affinity_with_a as u16 + x.affinity_with_b as u16;
        let cy = y.affinity_with_a as u16 + y.affinity_with_b as u16;
        cy.cmp(&cx).then(x.user_id.cmp(&y.user_id))
    });
    Ok(mutual)
}

/// Everything known about one pair, or `None` when they never interacted.
pub async fn analyze_relationship(
    store: &dyn RelationshipStore,
    guild_id: &str,
    user_a: &str,
    user_b: &str,
) -> Result<Option<RelationshipAnalysis>> {
    pair::ordered(user_a, user_b)?;

    let edge = store.edge_between(guild_id, user_a, user_b).await?;
    let entry = match relationship_between(store, guild_id, user_a, user_b).await? {
        RelationshipLookup::Found { entry } | RelationshipLookup::TrackedFromOtherSide { entry } => {
            Some(entry)
        }
        RelationshipLookup::NotFound => None,
    };
    if edge.is_none() && entry.is_none() {
        return Ok(None);
    }

    let segments = match store.pair(guild_id, user_a, user_b).await? {
        Some(pair) => store.segments_by_ids(guild_id, &pair.segment_ids).await?,
        None => Vec::new(),
    };

    let affinity_percentage = entry.as_ref().map(|e| e.affinity_percentage).unwrap_or(0);
    let interaction_count = edge
        .as_ref()
        .map(|e| e.total)
        .or_else(|| entry.as_ref().map(|e| e.interaction_count))
        .unwrap_or(0);
    let last_interaction = edge
        .as_ref()
        .map(|e| e.last_interaction)
        .or_else(|| entry.as_ref().map(|e| e.last_interaction));

    let total_messages: i64 = segments.iter().map(|s| s.message_count as i64).sum();
    let average_duration_minutes = if segments.is_empty() {
        0.0
    } else {
        segments.iter().map(|s| s.features.duration_minutes).sum::<f64>() / segments.len() as f64
    };
    let most_recent_conversation = segments
        .iter()
        .max_by_key(|s| s.end_time)
        .map(ConversationSummary::from);

    Ok(Some(RelationshipAnalysis {
        user_a: user_a.to_string(),
        user_b: user_b.to_string(),
        affinity_percentage,
        strength: StrengthLabel::from_affinity(affinity_percentage as f64),
        interaction_count,
        last_interaction,
        edge,
        log_score: affinity::log_scaled(interaction_count),
        conversation_count: segments.len(),
        total_messages,
        average_duration_minutes,
        most_recent_conversation,
    }))
}

pub async fn relationship_context(
    store: &dyn RelationshipStore,
    guild_id: &str,
    user_id: &str,
    limit: u32,
) -> Result<RelationshipContext> {
    let display_name = store
        .member(guild_id, user_id)
        .await?
        .and_then(|m| m.display_name);

    let mut relationships = Vec::new();
    for entry in top_relationships(store, guild_id, user_id, limit).await? {
        let neighbor = store.member(guild_id, &entry.user_id).await?;
        let pair = store.pair(guild_id, user_id, &entry.user_id).await?;
        let recent_conversation = match pair.as_ref().and_then(|p| p.segment_ids.first()) {
            Some(id) => store
                .segments_by_ids(guild_id, &[*id])
                .await?
                .first()
                .map(ConversationSummary::from),
            None => None,
        };

        relationships.push(ContextEntry {
            strength: StrengthLabel::from_affinity(entry.affinity_percentage as f64),
            display_name: neighbor.and_then(|m| m.display_name),
            pair_total_interactions: pair.map(|p| p.total_interactions),
            recent_conversation,
            user_id: entry.user_id,
            affinity_percentage: entry.affinity_percentage,
            interaction_count: entry.interaction_count,
            last_interaction: entry.last_interaction,
        });
    }

    Ok(RelationshipContext {
        guild_id: guild_id.to_string(),
        user_id: user_id.to_string(),
        display_name,
        relationships,
    })
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

async fn network_or_empty(
    store: &dyn RelationshipStore,
    guild_id: &str,
    user_id: &str,
) -> Result<Vec<MemberRelationshipEntry>> {
    Ok(store
        .relationship_network(guild_id, user_id)
        .await?
        .unwrap_or_default())
}

// ============================================================================
// TESTS
// ============================================================================
