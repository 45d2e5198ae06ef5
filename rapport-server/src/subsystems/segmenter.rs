//! Conversation Segmenter
//!
//! Two entry points build the same kind of segment:
//! - backfill: a single ascending pass over a pair's message history, one open
//!   segment at a time, split on channel change or a gap longer than the time
//!   window. Only segments with messages from both users are kept.
//! - incremental: `extend_or_open` folds each live message into the latest
//!   segment of its channel, or opens a new one seeded with its proximity
//!   partners. Serialized per (guild, channel).
//!
//! Segment ids are derived from (guild, channel, first message). Several pairs
//! can close a segment on the same first message, so backfill merges into an
//! existing row under the channel lock instead of overwriting it. Reruns land
//! on the same rows.

use chrono::Duration;
use uuid::Uuid;

use rapport_core::config::{MaintenanceConfig, SegmentationConfig};
use rapport_core::models::{pair, ChatMessage, ConversationSegment, SegmentFeatures};
use rapport_core::retry::{self, RetryPolicy};
use rapport_core::store::{decode_cursor, encode_cursor, PairCursor};
use rapport_core::{KeyedLocks, RelationshipStore, Result};

use super::mentions;
use super::proximity::RecentMessage;
use super::BatchReport;

const JOB: &str = "segment_backfill";

pub type ChannelKey = (String, String);

// ============================================================================
// PUBLIC API
// ============================================================================

/// Fetch the pair's history and cluster it into two-sided segments.
pub async fn detect_conversations(
    store: &dyn RelationshipStore,
    guild_id: &str,
    user_a: &str,
    user_b: &str,
    time_window_minutes: i64,
) -> Result<Vec<ConversationSegment>> {
    pair::ordered(user_a, user_b)?;

    let messages = store.messages_between(guild_id, user_a, user_b).await?;
    let name_a = display_name(store, guild_id, user_a).await?;
    let name_b = display_name(store, guild_id, user_b).await?;

    Ok(segment_messages(
        guild_id,
        (user_a, name_a.as_deref()),
        (user_b, name_b.as_deref()),
        &messages,
        time_window_minutes,
    ))
}

/// Single-pass clustering over messages ascending by time.
pub fn segment_messages(
    guild_id: &str,
    user_a: (&str, Option<&str>),
    user_b: (&str, Option<&str>),
    messages: &[ChatMessage],
    time_window_minutes: i64,
) -> Vec<ConversationSegment> {
    let window = Duration::minutes(time_window_minutes);
    let mut ordered: Vec<&ChatMessage> = messages
        .iter()
        .filter(|m| !m.is_bot && (m.author_id == user_a.0 || m.author_id == user_b.0))
        .collect();
    ordered.sort_by(|x, y| x.created_at.cmp(&y.created_at));

    let mut segments = Vec::new();
    let mut open: Vec<&ChatMessage> = Vec::new();

    for message in ordered {
        let split = match open.last() {
            None => false,
            Some(last) => {
                last.channel_id != message.channel_id || message.created_at - last.created_at > window
            }
        };
        if split {
            if let Some(segment) = close_segment(guild_id, user_a, user_b, &open) {
                segments.push(segment);
            }
            open.clear();
        }
        open.push(message);
    }
    if let Some(segment) = close_segment(guild_id, user_a, user_b, &open) {
        segments.push(segment);
    }

    segments
}

/// Detect, persist and link every segment for one pair. Returns how many were written.
pub async fn backfill_pair(
    store: &dyn RelationshipStore,
    locks: &KeyedLocks<ChannelKey>,
    config: &SegmentationConfig,
    guild_id: &str,
    user_a: &str,
    user_b: &str,
) -> Result<usize> {
    let segments =
        detect_conversations(store, guild_id, user_a, user_b, config.time_window_minutes).await?;

    // Oldest first so the newest ends up at the front of the pair's list
    for segment in &segments {
        let _guard = locks
            .lock((guild_id.to_string(), segment.channel_id.clone()))
            .await;
        merge_into_existing(store, segment).await?;
        store
            .link_segment(
                guild_id,
                user_a,
                user_b,
                segment.id,
                segment.end_time,
                config.max_pair_segments,
            )
            .await?;
    }

    Ok(segments.len())
}

/// Backfill every known pair in a guild, chunked with a checkpoint per page.
pub async fn backfill_guild(
    store: &dyn RelationshipStore,
    locks: &KeyedLocks<ChannelKey>,
    segmentation: &SegmentationConfig,
    maintenance: &MaintenanceConfig,
    guild_id: &str,
) -> BatchReport {
    let mut report = BatchReport::default();
    let policy = RetryPolicy {
        attempts: maintenance.retry_attempts,
        base_delay_ms: maintenance.retry_delay_ms,
    };
    let batch_size = maintenance.batch_size.max(1);

    let mut cursor: Option<PairCursor> = match store.load_checkpoint(JOB, guild_id).await {
        Ok(raw) => {
            report.resumed_from = raw.clone();
            raw.as_deref().and_then(decode_cursor)
        }
        Err(e) => {
            report.record_error("checkpoint", e);
            None
        }
    };

    loop {
        let after = cursor.as_ref();
        let page = match retry::with_backoff(policy, || store.pairs_after(guild_id, after, batch_size)).await {
            Ok(page) => page,
            Err(e) => {
                report.record_error("pairs page", e);
                return report;
            }
        };
        let Some(last) = page.last() else {
            break;
        };
        let next: PairCursor = (last.u_min.clone(), last.u_max.clone());
        report.batches += 1;

        for pair in &page {
            let result = retry::with_backoff(policy, || {
                backfill_pair(store, locks, segmentation, guild_id, &pair.u_min, &pair.u_max)
            })
            .await;
            match result {
                Ok(_) => report.processed += 1,
                Err(e) => report.record_error(&format!("{}:{}", pair.u_min, pair.u_max), e),
            }
        }

        if let Err(e) = store.save_checkpoint(JOB, guild_id, &encode_cursor(&next)).await {
            report.record_error("checkpoint", e);
        }
        cursor = Some(next);

        if page.len() < batch_size as usize {
            break;
        }
    }

    if let Err(e) = store.clear_checkpoint(JOB, guild_id).await {
        report.record_error("checkpoint", e);
    }
    report
}

/// Fold a live message into its channel's latest segment, or open a new
/// segment when it has proximity partners. Returns the touched segment id.
pub async fn extend_or_open(
    store: &dyn RelationshipStore,
    locks: &KeyedLocks<ChannelKey>,
    config: &SegmentationConfig,
    message: &ChatMessage,
    partners: &[RecentMessage],
) -> Result<Option<Uuid>> {
    if message.is_bot {
        return Ok(None);
    }
    let _guard = locks
        .lock((message.guild_id.clone(), message.channel_id.clone()))
        .await;

    let window = Duration::minutes(config.time_window_minutes);
    let mut involved: Vec<&str> = vec![message.author_id.as_str()];
    for partner in partners {
        if !involved.contains(&partner.author_id.as_str()) {
            involved.push(partner.author_id.as_str());
        }
    }

    let latest = store
        .latest_segment_in_channel(&message.guild_id, &message.channel_id)
        .await?;

    let mut segment = match latest {
        Some(segment)
            if message.created_at - segment.end_time <= window
                && segment.start_time - message.created_at <= window
                && involved.iter().any(|u| segment.has_participant(u)) =>
        {
            if segment.message_ids.contains(&message.id) {
                return Ok(Some(segment.id));
            }
            let mut segment = segment;
            for partner in partners {
                if !segment.message_ids.contains(&partner.message_id) {
                    segment.message_ids.push(partner.message_id.clone());
                }
                segment.start_time = segment.start_time.min(partner.created_at);
            }
            segment.message_ids.push(message.id.clone());
            segment.start_time = segment.start_time.min(message.created_at);
            segment.end_time = segment.end_time.max(message.created_at);
            segment
                .participants
                .extend(involved.iter().map(|u| u.to_string()));
            segment
        }
        _ => {
            if partners.is_empty() {
                return Ok(None);
            }
            open_segment(message, partners)
        }
    };

    segment.features.has_mentions |= mentions::has_mention(&message.content);
    if !segment.features.has_name_usage {
        segment.features.has_name_usage =
            names_other_participant(store, &segment, message).await?;
    }
    segment.refresh_derived();
    store.upsert_segment(&segment).await?;

    for other in segment.participants.iter().filter(|p| **p != message.author_id) {
        store
            .link_segment(
                &message.guild_id,
                &message.author_id,
                other,
                segment.id,
                segment.end_time,
                config.max_pair_segments,
            )
            .await?;
    }

    tracing::debug!(
        "Segment {} in {} now has {} messages",
        segment.id,
        message.channel_id,
        segment.message_count
    );
    Ok(Some(segment.id))
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

/// Upsert `segment`, folding it into a stored row with the same id. Caller
/// holds the channel lock.
async fn merge_into_existing(store: &dyn RelationshipStore, segment: &ConversationSegment) -> Result<()> {
    let existing = store
        .segments_by_ids(&segment.guild_id, &[segment.id])
        .await?
        .into_iter()
        .next();

    let Some(mut merged) = existing else {
        return store.upsert_segment(segment).await;
    };
    let before = merged.clone();
    merged.absorb(segment);
    if merged == before {
        return Ok(());
    }
    let rows = store
        .messages_by_ids(&merged.guild_id, &merged.message_ids)
        .await?;
    merged.order_messages(&rows);
    store.upsert_segment(&merged).await
}

fn close_segment(
    guild_id: &str,
    user_a: (&str, Option<&str>),
    user_b: (&str, Option<&str>),
    messages: &[&ChatMessage],
) -> Option<ConversationSegment> {
    let first = messages.first()?;
    let last = messages.last()?;

    let from_a = messages.iter().any(|m| m.author_id == user_a.0);
    let from_b = messages.iter().any(|m| m.author_id == user_b.0);
    if !(from_a && from_b) {
        return None;
    }

    let has_name_usage = messages.iter().any(|m| {
        let other_name = if m.author_id == user_a.0 { user_b.1 } else { user_a.1 };
        other_name.is_some_and(|name| mentions::uses_name(&m.content, name))
    });

    let mut segment = ConversationSegment {
        id: ConversationSegment::stable_id(guild_id, &first.channel_id, &first.id),
        guild_id: guild_id.to_string(),
        channel_id: first.channel_id.clone(),
        participants: vec![user_a.0.to_string(), user_b.0.to_string()],
        start_time: first.created_at,
        end_time: last.created_at,
        message_ids: messages.iter().map(|m| m.id.clone()).collect(),
        message_count: 0,
        features: SegmentFeatures {
            duration_minutes: 0.0,
            has_mentions: messages.iter().any(|m| mentions::has_mention(&m.content)),
            has_name_usage,
        },
        summary: None,
    };
    segment.refresh_derived();
    Some(segment)
}

fn open_segment(message: &ChatMessage, partners: &[RecentMessage]) -> ConversationSegment {
    let mut seeds: Vec<&RecentMessage> = partners.iter().collect();
    seeds.sort_by(|x, y| x.created_at.cmp(&y.created_at));

    let first_id = seeds
        .first()
        .map(|p| p.message_id.as_str())
        .unwrap_or(message.id.as_str());
    let start = seeds
        .first()
        .map(|p| p.created_at.min(message.created_at))
        .unwrap_or(message.created_at);

    let mut message_ids: Vec<String> = seeds.iter().map(|p| p.message_id.clone()).collect();
    message_ids.push(message.id.clone());
    let mut participants: Vec<String> = seeds.iter().map(|p| p.author_id.clone()).collect();
    participants.push(message.author_id.clone());

    ConversationSegment {
        id: ConversationSegment::stable_id(&message.guild_id, &message.channel_id, first_id),
        guild_id: message.guild_id.clone(),
        channel_id: message.channel_id.clone(),
        participants,
        start_time: start,
        end_time: message.created_at,
        message_ids,
        message_count: 0,
        features: SegmentFeatures::default(),
        summary: None,
    }
}

async fn display_name(
    store: &dyn RelationshipStore,
    guild_id: &str,
    user_id: &str,
) -> Result<Option<String>> {
    Ok(store
        .member(guild_id, user_id)
        .await?
        .and_then(|m| m.display_name))
}

async fn names_other_participant(
    store: &dyn RelationshipStore,
    segment: &ConversationSegment,
    message: &ChatMessage,
) -> Result<bool> {
    for other in segment.participants.iter().filter(|p| **p != message.author_id) {
        if let Some(name) = display_name(store, &message.guild_id, other).await? {
            if mentions::uses_name(&message.content, &name) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use rapport_core::models::Member;
    use rapport_core::store::MemoryStore;

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T18:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn chat(id: &str, author: &str, channel: &str, minute: i64, content: &str) -> ChatMessage {
        ChatMessage {
            guild_id: "g".into(),
            id: id.into(),
            channel_id: channel.into(),
            author_id: author.into(),
            content: content.into(),
            created_at: base() + Duration::minutes(minute),
            referenced_message_id: None,
            is_bot: false,
        }
    }

    fn recent(id: &str, author: &str, minute: i64) -> RecentMessage {
        RecentMessage {
            message_id: id.into(),
            author_id: author.into(),
            created_at: base() + Duration::minutes(minute),
        }
    }

    // ========================================================================
    // TEST 1: t=0,2,4,10 alternating A,B,A,B with a 5 minute window
    // ========================================================================
    #[test]
    fn test_gap_splits_and_one_sided_tail_dropped() {
        let messages = vec![
            chat("1", "A", "C", 0, "hey"),
            chat("2", "B", "C", 2, "hi"),
            chat("3", "A", "C", 4, "how are you"),
            chat("4", "B", "C", 10, "sorry, was afk"),
        ];
        let segments = segment_messages("g", ("A", None), ("B", None), &messages, 5);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].message_count, 3);
        assert_eq!(segments[0].message_ids, vec!["1", "2", "3"]);
        assert_eq!(segments[0].features.duration_minutes, 4.0);
    }

    // ========================================================================
    // TEST 2: channel change closes the open segment
    // ========================================================================
    #[test]
    fn test_channel_change_splits() {
        let messages = vec![
            chat("1", "A", "C", 0, "x"),
            chat("2", "B", "C", 1, "y"),
            chat("3", "A", "D", 2, "z"),
            chat("4", "B", "D", 3, "w"),
        ];
        let segments = segment_messages("g", ("A", None), ("B", None), &messages, 5);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].channel_id, "C");
        assert_eq!(segments[1].channel_id, "D");
    }

    // ========================================================================
    // TEST 3: every emitted segment is two-sided
    // ========================================================================
    #[test]
    fn test_segments_always_two_sided() {
        let messages = vec![
            chat("1", "A", "C", 0, "monologue"),
            chat("2", "A", "C", 1, "still me"),
            chat("3", "A", "C", 20, "anyone?"),
            chat("4", "B", "C", 22, "me"),
            chat("5", "B", "C", 60, "late"),
        ];
        let segments = segment_messages("g", ("A", None), ("B", None), &messages, 5);
        assert_eq!(segments.len(), 1);
        for s in &segments {
            assert!(s.has_participant("A") && s.has_participant("B"));
        }
        assert_eq!(segments[0].message_ids, vec!["3", "4"]);
    }

    // ========================================================================
    // TEST 4: features
    // ========================================================================
    #[test]
    fn test_segment_features() {
        let messages = vec![
            chat("1", "A", "C", 0, "<@99> look"),
            chat("2", "B", "C", 1, "nice one alice"),
        ];
        let segments = segment_messages("g", ("A", Some("Alice")), ("B", Some("Bob")), &messages, 5);
        assert!(segments[0].features.has_mentions);
        assert!(segments[0].features.has_name_usage);
    }

    // ========================================================================
    // TEST 5: backfill is idempotent and links segments into the pair
    // ========================================================================
    #[tokio::test]
    async fn test_backfill_pair_idempotent() {
        let store = MemoryStore::new();
        for m in [
            chat("1", "A", "C", 0, "a"),
            chat("2", "B", "C", 1, "b"),
            chat("3", "A", "C", 30, "c"),
            chat("4", "B", "C", 31, "d"),
        ] {
            store.log_message(&m).await.unwrap();
        }
        let config = SegmentationConfig::default();
        let locks = KeyedLocks::new();

        assert_eq!(backfill_pair(&store, &locks, &config, "g", "A", "B").await.unwrap(), 2);
        assert_eq!(backfill_pair(&store, &locks, &config, "g", "B", "A").await.unwrap(), 2);

        assert_eq!(store.all_segments("g").len(), 2);
        let pair = store.pair("g", "A", "B").await.unwrap().unwrap();
        assert_eq!(pair.segment_ids.len(), 2);
        assert_eq!(pair.segment_ids[0], ConversationSegment::stable_id("g", "C", "3"));
    }

    // ========================================================================
    // TEST 6: self-pair is rejected
    // ========================================================================
    #[tokio::test]
    async fn test_detect_self_pair_rejected() {
        let store = MemoryStore::new();
        assert!(detect_conversations(&store, "g", "A", "A", 5).await.is_err());
    }

    // ========================================================================
    // TEST 7: incremental open, extend, and no-op without partners
    // ========================================================================
    #[tokio::test]
    async fn test_extend_or_open() {
        let store = MemoryStore::new();
        store
            .upsert_member(&Member {
                guild_id: "g".into(),
                user_id: "A".into(),
                display_name: Some("Alice".into()),
                is_bot: false,
            })
            .await
            .unwrap();
        let locks = KeyedLocks::new();
        let config = SegmentationConfig::default();

        let lonely = chat("1", "A", "C", 0, "hello?");
        assert_eq!(extend_or_open(&store, &locks, &config, &lonely, &[]).await.unwrap(), None);

        let reply = chat("2", "B", "C", 1, "hi alice");
        let opened = extend_or_open(&store, &locks, &config, &reply, &[recent("1", "A", 0)])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened, ConversationSegment::stable_id("g", "C", "1"));

        let joiner = chat("3", "D", "C", 3, "what's up");
        let extended = extend_or_open(&store, &locks, &config, &joiner, &[recent("2", "B", 1)])
            .await
            .unwrap();
        assert_eq!(extended, Some(opened));

        let segment = &store.all_segments("g")[0];
        assert_eq!(segment.message_ids, vec!["1", "2", "3"]);
        assert_eq!(segment.participants, vec!["A", "B", "D"]);
        assert!(segment.features.has_name_usage);

        let pair = store.pair("g", "D", "B").await.unwrap().unwrap();
        assert_eq!(pair.segment_ids, vec![opened]);
        assert!(locks.is_empty());
    }

    // ========================================================================
    // TEST 8: a message past the window opens a fresh segment
    // ========================================================================
    #[tokio::test]
    async fn test_stale_segment_not_extended() {
        let store = MemoryStore::new();
        let locks = KeyedLocks::new();
        let config = SegmentationConfig::default();

        let first = extend_or_open(
            &store,
            &locks,
            &config,
            &chat("2", "B", "C", 1, "hi"),
            &[recent("1", "A", 0)],
        )
        .await
        .unwrap();
        let later = extend_or_open(
            &store,
            &locks,
            &config,
            &chat("4", "B", "C", 40, "back"),
            &[recent("3", "A", 39)],
        )
        .await
        .unwrap();
        assert_ne!(first, later);
        assert_eq!(store.all_segments("g").len(), 2);
    }

    // ========================================================================
    // TEST 9: pairs sharing a first message merge into one segment
    // ========================================================================
    #[tokio::test]
    async fn test_backfill_shared_first_message_merges() {
        let store = MemoryStore::new();
        for m in [
            chat("1", "A", "C", 0, "morning all"),
            chat("2", "B", "C", 1, "hey"),
            chat("3", "C", "C", 2, "hi"),
        ] {
            store.log_message(&m).await.unwrap();
        }
        let config = SegmentationConfig::default();
        let locks = KeyedLocks::new();

        backfill_pair(&store, &locks, &config, "g", "A", "B").await.unwrap();
        backfill_pair(&store, &locks, &config, "g", "A", "C").await.unwrap();

        let segments = store.all_segments("g");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].participants, vec!["A", "B", "C"]);
        assert_eq!(segments[0].message_ids, vec!["1", "2", "3"]);
        assert_eq!(segments[0].end_time, base() + Duration::minutes(2));
        assert!(locks.is_empty());
    }
}
