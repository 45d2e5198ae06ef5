//! PostgreSQL implementation of `RelationshipStore`
//!
//! All counter updates are single-statement upserts so concurrent writers
//! never lose increments. Network replacement runs under a transaction-scoped
//! advisory lock keyed by (guild, member).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{PairCursor, RelationshipStore, RollingUpdate};
use crate::error::{RapportError, Result};
use crate::models::{
    pair, ChatMessage, ConversationSegment, DirectedEdge, InteractionEvent, Member,
    MemberRelationshipEntry, UndirectedPair,
};

const EDGE_COLUMNS: &str = "guild_id, user_a, user_b, last_interaction, msg_a_to_b, msg_b_to_a, \
     mentions, replies, reactions, rolling_7d, rolling_30d, total";

const SEGMENT_COLUMNS: &str = "id, guild_id, channel_id, participants, start_time, end_time, \
     message_ids, message_count, features, summary";

const MESSAGE_COLUMNS: &str =
    "guild_id, id, channel_id, author_id, content, created_at, referenced_message_id, is_bot";

#[derive(Debug, Clone)]
pub struct PgRelationshipStore {
    pool: PgPool,
}

impl PgRelationshipStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RelationshipStore for PgRelationshipStore {
    async fn upsert_member(&self, member: &Member) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO guild_members (guild_id, user_id, display_name, is_bot)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (guild_id, user_id)
            DO UPDATE SET display_name = EXCLUDED.display_name, is_bot = EXCLUDED.is_bot
            "#,
        )
        .bind(&member.guild_id)
        .bind(&member.user_id)
        .bind(&member.display_name)
        .bind(member.is_bot)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn member(&self, guild_id: &str, user_id: &str) -> Result<Option<Member>> {
        let row = sqlx::query_as::<_, Member>(
            r#"
            SELECT guild_id, user_id, display_name, is_bot
            FROM guild_members
            WHERE guild_id = $1 AND user_id = $2
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn members_after(
        &self,
        guild_id: &str,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Member>> {
        let rows = sqlx::query_as::<_, Member>(
            r#"
            SELECT guild_id, user_id, display_name, is_bot
            FROM guild_members
            WHERE guild_id = $1 AND user_id > $2
            ORDER BY user_id
            LIMIT $3
            "#,
        )
        .bind(guild_id)
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn relationship_network(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Option<Vec<MemberRelationshipEntry>>> {
        let row: Option<Json<Vec<MemberRelationshipEntry>>> = sqlx::query_scalar(
            r#"
            SELECT relationship_network
            FROM guild_members
            WHERE guild_id = $1 AND user_id = $2
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|Json(entries)| entries))
    }

    async fn replace_relationship_network(
        &self,
        guild_id: &str,
        user_id: &str,
        entries: &[MemberRelationshipEntry],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("rapport:network:{}:{}", guild_id, user_id))
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            UPDATE guild_members
            SET relationship_network = $3, network_updated_at = now()
            WHERE guild_id = $1 AND user_id = $2
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .bind(Json(entries))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RapportError::MemberNotFound {
                guild_id: guild_id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    async fn increment_edge(&self, event: &InteractionEvent) -> Result<DirectedEdge> {
        let query = format!(
            r#"
            INSERT INTO relationship_edges AS e
                (guild_id, user_a, user_b, last_interaction,
                 msg_a_to_b, msg_b_to_a, mentions, replies, reactions, total)
            VALUES ($1, $2, $3, $4,
                CASE WHEN $5::text = 'message' THEN 1 ELSE 0 END,
                0,
                CASE WHEN $5::text = 'mention' THEN 1 ELSE 0 END,
                CASE WHEN $5::text = 'reply' THEN 1 ELSE 0 END,
                CASE WHEN $5::text = 'reaction' THEN 1 ELSE 0 END,
                1)
            ON CONFLICT (guild_id, LEAST(user_a, user_b), GREATEST(user_a, user_b))
            DO UPDATE SET
                msg_a_to_b = e.msg_a_to_b
                    + CASE WHEN $5::text = 'message' AND e.user_a = $2 THEN 1 ELSE 0 END,
                msg_b_to_a = e.msg_b_to_a
                    + CASE WHEN $5::text = 'message' AND e.user_a <> $2 THEN 1 ELSE 0 END,
                mentions = e.mentions + CASE WHEN $5::text = 'mention' THEN 1 ELSE 0 END,
                replies = e.replies + CASE WHEN $5::text = 'reply' THEN 1 ELSE 0 END,
                reactions = e.reactions + CASE WHEN $5::text = 'reaction' THEN 1 ELSE 0 END,
                total = e.total + 1,
                last_interaction = GREATEST(e.last_interaction, EXCLUDED.last_interaction)
            RETURNING {}
            "#,
            EDGE_COLUMNS
        );

        let edge = sqlx::query_as::<_, DirectedEdge>(&query)
            .bind(&event.guild_id)
            .bind(&event.from_user)
            .bind(&event.to_user)
            .bind(event.timestamp)
            .bind(event.kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(edge)
    }

    async fn edge_between(&self, guild_id: &str, x: &str, y: &str) -> Result<Option<DirectedEdge>> {
        let query = format!(
            r#"
            SELECT {}
            FROM relationship_edges
            WHERE guild_id = $1
              AND ((user_a = $2 AND user_b = $3) OR (user_a = $3 AND user_b = $2))
            "#,
            EDGE_COLUMNS
        );
        let edge = sqlx::query_as::<_, DirectedEdge>(&query)
            .bind(guild_id)
            .bind(x)
            .bind(y)
            .fetch_optional(&self.pool)
            .await?;
        Ok(edge)
    }

    async fn edges_for_member(&self, guild_id: &str, user_id: &str) -> Result<Vec<DirectedEdge>> {
        let query = format!(
            r#"
            SELECT {}
            FROM relationship_edges
            WHERE guild_id = $1 AND (user_a = $2 OR user_b = $2)
            ORDER BY user_a, user_b
            "#,
            EDGE_COLUMNS
        );
        let edges = sqlx::query_as::<_, DirectedEdge>(&query)
            .bind(guild_id)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(edges)
    }

    async fn edges_after(
        &self,
        guild_id: &str,
        after: Option<&PairCursor>,
        limit: u32,
    ) -> Result<Vec<DirectedEdge>> {
        let (after_a, after_b) = after
            .map(|(a, b)| (a.as_str(), b.as_str()))
            .unwrap_or(("", ""));
        let query = format!(
            r#"
            SELECT {}
            FROM relationship_edges
            WHERE guild_id = $1 AND (user_a, user_b) > ($2, $3)
            ORDER BY user_a, user_b
            LIMIT $4
            "#,
            EDGE_COLUMNS
        );
        let edges = sqlx::query_as::<_, DirectedEdge>(&query)
            .bind(guild_id)
            .bind(after_a)
            .bind(after_b)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(edges)
    }

    async fn set_rolling_windows(&self, guild_id: &str, updates: &[RollingUpdate]) -> Result<u64> {
        if updates.is_empty() {
            return Ok(0);
        }

        let user_a: Vec<String> = updates.iter().map(|u| u.user_a.clone()).collect();
        let user_b: Vec<String> = updates.iter().map(|u| u.user_b.clone()).collect();
        let r7: Vec<i64> = updates.iter().map(|u| u.rolling_7d).collect();
        let r30: Vec<i64> = updates.iter().map(|u| u.rolling_30d).collect();

        let result = sqlx::query(
            r#"
            UPDATE relationship_edges AS e
            SET rolling_7d = LEAST(u.r7, e.total),
                rolling_30d = LEAST(u.r30, e.total)
            FROM UNNEST($2::text[], $3::text[], $4::bigint[], $5::bigint[])
                AS u(user_a, user_b, r7, r30)
            WHERE e.guild_id = $1 AND e.user_a = u.user_a AND e.user_b = u.user_b
            "#,
        )
        .bind(guild_id)
        .bind(&user_a)
        .bind(&user_b)
        .bind(&r7)
        .bind(&r30)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn touch_pair(&self, event: &InteractionEvent) -> Result<()> {
        let (u_min, u_max) = pair::ordered(&event.from_user, &event.to_user)?;
        sqlx::query(
            r#"
            INSERT INTO relationship_pairs (guild_id, u_min, u_max, last_interaction, total_interactions)
            VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT (guild_id, u_min, u_max)
            DO UPDATE SET
                total_interactions = relationship_pairs.total_interactions + 1,
                last_interaction = GREATEST(relationship_pairs.last_interaction, EXCLUDED.last_interaction)
            "#,
        )
        .bind(&event.guild_id)
        .bind(u_min)
        .bind(u_max)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pair(&self, guild_id: &str, x: &str, y: &str) -> Result<Option<UndirectedPair>> {
        let (u_min, u_max) = pair::ordered(x, y)?;
        let row = sqlx::query_as::<_, UndirectedPair>(
            r#"
            SELECT guild_id, u_min, u_max, last_interaction, total_interactions, segment_ids
            FROM relationship_pairs
            WHERE guild_id = $1 AND u_min = $2 AND u_max = $3
            "#,
        )
        .bind(guild_id)
        .bind(u_min)
        .bind(u_max)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn pairs_after(
        &self,
        guild_id: &str,
        after: Option<&PairCursor>,
        limit: u32,
    ) -> Result<Vec<UndirectedPair>> {
        let (after_min, after_max) = after
            .map(|(a, b)| (a.as_str(), b.as_str()))
            .unwrap_or(("", ""));
        let rows = sqlx::query_as::<_, UndirectedPair>(
            r#"
            SELECT guild_id, u_min, u_max, last_interaction, total_interactions, segment_ids
            FROM relationship_pairs
            WHERE guild_id = $1 AND (u_min, u_max) > ($2, $3)
            ORDER BY u_min, u_max
            LIMIT $4
            "#,
        )
        .bind(guild_id)
        .bind(after_min)
        .bind(after_max)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn link_segment(
        &self,
        guild_id: &str,
        x: &str,
        y: &str,
        segment_id: Uuid,
        at: DateTime<Utc>,
        cap: usize,
    ) -> Result<()> {
        let (u_min, u_max) = pair::ordered(x, y)?;
        sqlx::query(
            r#"
            INSERT INTO relationship_pairs
                (guild_id, u_min, u_max, last_interaction, total_interactions, segment_ids)
            VALUES ($1, $2, $3, $4, 0, ARRAY[$5::uuid])
            ON CONFLICT (guild_id, u_min, u_max)
            DO UPDATE SET segment_ids =
                (ARRAY[$5::uuid] || array_remove(relationship_pairs.segment_ids, $5::uuid))[1:$6]
            "#,
        )
        .bind(guild_id)
        .bind(u_min)
        .bind(u_max)
        .bind(at)
        .bind(segment_id)
        .bind(cap as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_message(&self, message: &ChatMessage) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO chat_messages
                (guild_id, id, channel_id, author_id, content, created_at, referenced_message_id, is_bot)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (guild_id, id) DO NOTHING
            "#,
        )
        .bind(&message.guild_id)
        .bind(&message.id)
        .bind(&message.channel_id)
        .bind(&message.author_id)
        .bind(&message.content)
        .bind(message.created_at)
        .bind(&message.referenced_message_id)
        .bind(message.is_bot)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn message(&self, guild_id: &str, message_id: &str) -> Result<Option<ChatMessage>> {
        let query = format!(
            "SELECT {} FROM chat_messages WHERE guild_id = $1 AND id = $2",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query_as::<_, ChatMessage>(&query)
            .bind(guild_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn messages_by_ids(&self, guild_id: &str, ids: &[String]) -> Result<Vec<ChatMessage>> {
        let query = format!(
            r#"
            SELECT {}
            FROM chat_messages
            WHERE guild_id = $1 AND id = ANY($2)
            ORDER BY created_at, id
            "#,
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, ChatMessage>(&query)
            .bind(guild_id)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn messages_between(&self, guild_id: &str, x: &str, y: &str) -> Result<Vec<ChatMessage>> {
        let query = format!(
            r#"
            SELECT {}
            FROM chat_messages
            WHERE guild_id = $1 AND author_id IN ($2, $3) AND NOT is_bot
            ORDER BY created_at, id
            "#,
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, ChatMessage>(&query)
            .bind(guild_id)
            .bind(x)
            .bind(y)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn upsert_segment(&self, segment: &ConversationSegment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_segments
                (id, guild_id, channel_id, participants, start_time, end_time,
                 message_ids, message_count, features, summary)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                participants = EXCLUDED.participants,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                message_ids = EXCLUDED.message_ids,
                message_count = EXCLUDED.message_count,
                features = EXCLUDED.features,
                summary = COALESCE(EXCLUDED.summary, conversation_segments.summary)
            "#,
        )
        .bind(segment.id)
        .bind(&segment.guild_id)
        .bind(&segment.channel_id)
        .bind(&segment.participants)
        .bind(segment.start_time)
        .bind(segment.end_time)
        .bind(&segment.message_ids)
        .bind(segment.message_count)
        .bind(Json(&segment.features))
        .bind(&segment.summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unlink_segment(&self, guild_id: &str, segment_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE relationship_pairs
            SET segment_ids = array_remove(segment_ids, $2::uuid)
            WHERE guild_id = $1 AND $2::uuid = ANY(segment_ids)
            "#,
        )
        .bind(guild_id)
        .bind(segment_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_segment(&self, guild_id: &str, segment_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM conversation_segments WHERE guild_id = $1 AND id = $2")
            .bind(guild_id)
            .bind(segment_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn segments_by_ids(&self, guild_id: &str, ids: &[Uuid]) -> Result<Vec<ConversationSegment>> {
        let query = format!(
            r#"
            SELECT {}
            FROM conversation_segments
            WHERE guild_id = $1 AND id = ANY($2)
            ORDER BY start_time
            "#,
            SEGMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, ConversationSegment>(&query)
            .bind(guild_id)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn segment_channels(&self, guild_id: &str) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT channel_id FROM conversation_segments WHERE guild_id = $1 ORDER BY channel_id",
        )
        .bind(guild_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn segments_in_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Vec<ConversationSegment>> {
        let query = format!(
            r#"
            SELECT {}
            FROM conversation_segments
            WHERE guild_id = $1 AND channel_id = $2
            ORDER BY start_time, id
            "#,
            SEGMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, ConversationSegment>(&query)
            .bind(guild_id)
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn latest_segment_in_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Option<ConversationSegment>> {
        let query = format!(
            r#"
            SELECT {}
            FROM conversation_segments
            WHERE guild_id = $1 AND channel_id = $2
            ORDER BY end_time DESC
            LIMIT 1
            "#,
            SEGMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, ConversationSegment>(&query)
            .bind(guild_id)
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn load_checkpoint(&self, job: &str, guild_id: &str) -> Result<Option<String>> {
        let cursor: Option<String> = sqlx::query_scalar(
            "SELECT cursor FROM batch_checkpoints WHERE job = $1 AND guild_id = $2",
        )
        .bind(job)
        .bind(guild_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cursor)
    }

    async fn save_checkpoint(&self, job: &str, guild_id: &str, cursor: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batch_checkpoints (job, guild_id, cursor)
            VALUES ($1, $2, $3)
            ON CONFLICT (job, guild_id) DO UPDATE SET cursor = EXCLUDED.cursor, updated_at = now()
            "#,
        )
        .bind(job)
        .bind(guild_id)
        .bind(cursor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_checkpoint(&self, job: &str, guild_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM batch_checkpoints WHERE job = $1 AND guild_id = $2")
            .bind(job)
            .bind(guild_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn guilds(&self) -> Result<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT guild_id FROM guild_members ORDER BY guild_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn purge_guild(&self, guild_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let edges = sqlx::query("DELETE FROM relationship_edges WHERE guild_id = $1")
            .bind(guild_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        for table in ["relationship_pairs", "conversation_segments", "chat_messages", "batch_checkpoints"] {
            sqlx::query(&format!("DELETE FROM {} WHERE guild_id = $1", table))
                .bind(guild_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "UPDATE guild_members SET relationship_network = '[]'::jsonb, network_updated_at = now() WHERE guild_id = $1",
        )
        .bind(guild_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(guild_id, edges, "Purged relationship data for guild");
        Ok(edges)
    }

    async fn health(&self) -> Result<String> {
        Ok(crate::db::health_check(&self.pool).await?)
    }
}
