//! Storage abstraction for relationship data
//!
//! `RelationshipStore` is the single seam between the engine and the row
//! store. `PgRelationshipStore` is the production implementation; the
//! in-memory store behind the `testing` feature mirrors its semantics so the
//! engine can be exercised without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ChatMessage, ConversationSegment, DirectedEdge, InteractionEvent, Member,
    MemberRelationshipEntry, UndirectedPair,
};

#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod postgres;

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryStore;
pub use postgres::PgRelationshipStore;

/// Keyset cursor over (user_a, user_b) or (u_min, u_max).
pub type PairCursor = (String, String);

/// Recomputed rolling-window flags for one edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingUpdate {
    pub user_a: String,
    pub user_b: String,
    pub rolling_7d: i64,
    pub rolling_30d: i64,
}

#[async_trait]
pub trait RelationshipStore: Send + Sync {
    // --- member directory -------------------------------------------------

    async fn upsert_member(&self, member: &Member) -> Result<()>;

    async fn member(&self, guild_id: &str, user_id: &str) -> Result<Option<Member>>;

    /// Members ordered by user id, strictly after `after`.
    async fn members_after(
        &self,
        guild_id: &str,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Member>>;

    /// `None` when the member is unknown.
    async fn relationship_network(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Option<Vec<MemberRelationshipEntry>>>;

    /// Replace the whole network. Fails with `MemberNotFound` for unknown members.
    async fn replace_relationship_network(
        &self,
        guild_id: &str,
        user_id: &str,
        entries: &[MemberRelationshipEntry],
    ) -> Result<()>;

    // --- edge store -------------------------------------------------------

    /// Atomic increment; creates the row on first write.
    async fn increment_edge(&self, event: &InteractionEvent) -> Result<DirectedEdge>;

    /// The edge between two users, whichever orientation it was created in.
    async fn edge_between(&self, guild_id: &str, x: &str, y: &str) -> Result<Option<DirectedEdge>>;

    async fn edges_for_member(&self, guild_id: &str, user_id: &str) -> Result<Vec<DirectedEdge>>;

    async fn edges_after(
        &self,
        guild_id: &str,
        after: Option<&PairCursor>,
        limit: u32,
    ) -> Result<Vec<DirectedEdge>>;

    async fn set_rolling_windows(&self, guild_id: &str, updates: &[RollingUpdate]) -> Result<u64>;

    // --- pair cache -------------------------------------------------------

    /// `total_interactions += 1`, `last_interaction = max(current, event time)`.
    async fn touch_pair(&self, event: &InteractionEvent) -> Result<()>;

    async fn pair(&self, guild_id: &str, x: &str, y: &str) -> Result<Option<UndirectedPair>>;

    async fn pairs_after(
        &self,
        guild_id: &str,
        after: Option<&PairCursor>,
        limit: u32,
    ) -> Result<Vec<UndirectedPair>>;

    /// Put `segment_id` at the front of the pair's bounded evidence list.
    async fn link_segment(
        &self,
        guild_id: &str,
        x: &str,
        y: &str,
        segment_id: Uuid,
        at: DateTime<Utc>,
        cap: usize,
    ) -> Result<()>;

    /// Remove a segment id from every pair's evidence list in the guild.
    /// Returns the number of pairs that referenced it.
    async fn unlink_segment(&self, guild_id: &str, segment_id: Uuid) -> Result<u64>;

    // --- message log ------------------------------------------------------

    /// Returns false when the message was already logged.
    async fn log_message(&self, message: &ChatMessage) -> Result<bool>;

    async fn message(&self, guild_id: &str, message_id: &str) -> Result<Option<ChatMessage>>;

    async fn messages_by_ids(&self, guild_id: &str, ids: &[String]) -> Result<Vec<ChatMessage>>;

    /// Non-bot messages authored by either user, ascending by time.
    async fn messages_between(&self, guild_id: &str, x: &str, y: &str) -> Result<Vec<ChatMessage>>;

    // --- segment store ----------------------------------------------------

    async fn upsert_segment(&self, segment: &ConversationSegment) -> Result<()>;

    /// Returns false when the segment was already gone.
    async fn delete_segment(&self, guild_id: &str, segment_id: Uuid) -> Result<bool>;

    async fn segments_by_ids(&self, guild_id: &str, ids: &[Uuid]) -> Result<Vec<ConversationSegment>>;

    async fn segment_channels(&self, guild_id: &str) -> Result<Vec<String>>;

    /// Ordered by start time.
    async fn segments_in_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Vec<ConversationSegment>>;

    async fn latest_segment_in_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Option<ConversationSegment>>;

    // --- batch checkpoints ------------------------------------------------

    async fn load_checkpoint(&self, job: &str, guild_id: &str) -> Result<Option<String>>;

    async fn save_checkpoint(&self, job: &str, guild_id: &str, cursor: &str) -> Result<()>;

    async fn clear_checkpoint(&self, job: &str, guild_id: &str) -> Result<()>;

    // --- administration ---------------------------------------------------

    /// Guilds with at least one known member.
    async fn guilds(&self) -> Result<Vec<String>>;

    /// Remove every derived row for a guild. Returns the number of edges deleted.
    async fn purge_guild(&self, guild_id: &str) -> Result<u64>;

    /// Backend version string for health checks.
    async fn health(&self) -> Result<String>;
}

/// Encode a pair cursor for the checkpoint table.
pub fn encode_cursor(cursor: &PairCursor) -> String {
    format!("{}\u{1f}{}", cursor.0, cursor.1)
}

pub fn decode_cursor(raw: &str) -> Option<PairCursor> {
    let (a, b) = raw.split_once('\u{1f}')?;
    Some((a.to_string(), b.to_string()))
}
