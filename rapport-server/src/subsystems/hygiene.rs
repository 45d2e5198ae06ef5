//! Segment hygiene: drop deleted and bot-authored messages from stored
//! segments, and destroy segments that no longer describe a conversation
//! along with the pair links pointing at them.

use std::collections::HashMap;

use serde::Serialize;

use rapport_core::models::{ChatMessage, ConversationSegment};
use rapport_core::{KeyedLocks, RelationshipStore, Result};

use super::segmenter::ChannelKey;

#[derive(Debug, Clone, Default, Serialize)]
pub struct HygieneReport {
    pub segments_scanned: usize,
    pub segments_updated: usize,
    pub segments_deleted: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentFate {
    Keep,
    Update(ConversationSegment),
    Delete,
}

/// Decide what happens to `segment` given the messages that still exist.
pub fn filter_segment(segment: &ConversationSegment, surviving: &[ChatMessage]) -> SegmentFate {
    let by_id: HashMap<&str, &ChatMessage> = surviving
        .iter()
        .filter(|m| !m.is_bot)
        .map(|m| (m.id.as_str(), m))
        .collect();

    let kept: Vec<&ChatMessage> = segment
        .message_ids
        .iter()
        .filter_map(|id| by_id.get(id.as_str()).copied())
        .collect();

    let (Some(first), Some(last)) = (
        kept.iter().min_by_key(|m| m.created_at),
        kept.iter().max_by_key(|m| m.created_at),
    ) else {
        return SegmentFate::Delete;
    };

    let mut cleaned = segment.clone();
    cleaned.message_ids = kept.iter().map(|m| m.id.clone()).collect();
    cleaned.participants = kept.iter().map(|m| m.author_id.clone()).collect();
    cleaned.start_time = first.created_at;
    cleaned.end_time = last.created_at;
    cleaned.refresh_derived();

    if cleaned.participants.len() < 2 {
        return SegmentFate::Delete;
    }
    if cleaned == *segment {
        SegmentFate::Keep
    } else {
        SegmentFate::Update(cleaned)
    }
}

/// Filter every stored segment of a guild against the message log.
pub async fn clean_guild(
    store: &dyn RelationshipStore,
    locks: &KeyedLocks<ChannelKey>,
    guild_id: &str,
) -> Result<HygieneReport> {
    let mut report = HygieneReport::default();

    for channel_id in store.segment_channels(guild_id).await? {
        let _guard = locks.lock((guild_id.to_string(), channel_id.clone())).await;
        for segment in store.segments_in_channel(guild_id, &channel_id).await? {
            report.segments_scanned += 1;
            let surviving = store.messages_by_ids(guild_id, &segment.message_ids).await?;
            match filter_segment(&segment, &surviving) {
                SegmentFate::Keep => {}
                SegmentFate::Update(cleaned) => {
                    store.upsert_segment(&cleaned).await?;
                    report.segments_updated += 1;
                }
                SegmentFate::Delete => {
                    if store.delete_segment(guild_id, segment.id).await? {
                        report.segments_deleted += 1;
                    }
                    store.unlink_segment(guild_id, segment.id).await?;
                }
            }
        }
    }

    if report.segments_updated + report.segments_deleted > 0 {
        tracing::info!(
            "Hygiene for {}: {} updated, {} deleted of {} segments",
            guild_id,
            report.segments_updated,
            report.segments_deleted,
            report.segments_scanned
        );
    }
    Ok(report)
}
