//! Segment Consolidator: merge adjacent conversations after the fact
//!
//! Per channel, segments ordered by start time. For each segment not yet
//! merged, every other unmerged segment reachable through a chain of
//! "within the merge gap and sharing a participant" links is folded into it.
//! The earliest segment survives; the rest are deleted and dropped from
//! every pair's evidence list.
//!
//! Single pass, not a fixed point: a merged segment is not re-examined against
//! the rest of the channel within the same run. Losing a delete race to a
//! concurrent run is a `ConsolidationConflict`, counted and ignored.

use serde::Serialize;
use uuid::Uuid;

use rapport_core::config::SegmentationConfig;
use rapport_core::models::ConversationSegment;
use rapport_core::{KeyedLocks, RapportError, RelationshipStore, Result};

use super::segmenter::ChannelKey;

// ============================================================================
// PUBLIC API
// ============================================================================

/// Report from a consolidation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationReport {
    pub channels_scanned: usize,
    pub segments_scanned: usize,
    pub merges: usize,
    pub segments_deleted: usize,
    pub conflicts: usize,
}

/// One planned merge: the surviving segment (already folded) and the ids it absorbed.
#[derive(Debug, Clone)]
pub struct MergeGroup {
    pub survivor: ConversationSegment,
    pub absorbed: Vec<Uuid>,
}

/// Plan merges for one channel's segments. Pure; input order does not matter.
pub fn plan_merges(segments: &[ConversationSegment], merge_gap_minutes: i64) -> Vec<MergeGroup> {
    let mut order: Vec<&ConversationSegment> = segments.iter().collect();
    order.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));

    let gap = merge_gap_minutes as f64;
    let mut merged = vec![false; order.len()];
    let mut groups = Vec::new();

    for i in 0..order.len() {
        if merged[i] {
            continue;
        }
        merged[i] = true;

        let mut members = vec![i];
        let mut frontier = vec![i];
        while let Some(k) = frontier.pop() {
            for j in 0..order.len() {
                if merged[j] || order[j].channel_id != order[k].channel_id {
                    continue;
                }
                if order[k].gap_minutes(order[j]) <= gap && order[k].shares_participant(order[j]) {
                    merged[j] = true;
                    members.push(j);
                    frontier.push(j);
                }
            }
        }

        if members.len() < 2 {
            continue;
        }
        members.sort_unstable();

        let mut survivor = order[members[0]].clone();
        let mut absorbed = Vec::with_capacity(members.len() - 1);
        for &j in &members[1..] {
            survivor.absorb(order[j]);
            absorbed.push(order[j].id);
        }
        groups.push(MergeGroup { survivor, absorbed });
    }

    groups
}

/// Consolidate every channel of a guild.
pub async fn consolidate_guild(
    store: &dyn RelationshipStore,
    locks: &KeyedLocks<ChannelKey>,
    config: &SegmentationConfig,
    guild_id: &str,
) -> Result<ConsolidationReport> {
    let mut report = ConsolidationReport::default();

    for channel_id in store.segment_channels(guild_id).await? {
        let _guard = locks.lock((guild_id.to_string(), channel_id.clone())).await;
        let segments = store.segments_in_channel(guild_id, &channel_id).await?;
        report.channels_scanned += 1;
        report.segments_scanned += segments.len();

        for group in plan_merges(&segments, config.merge_gap_minutes) {
            apply_merge(store, config, &group, &mut report).await?;
        }
    }

    tracing::info!(
        "Consolidation for {}: {} segments scanned, {} merges, {} deleted",
        guild_id,
        report.segments_scanned,
        report.merges,
        report.segments_deleted
    );
    Ok(report)
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

async fn apply_merge(
    store: &dyn RelationshipStore,
    config: &SegmentationConfig,
    group: &MergeGroup,
    report: &mut ConsolidationReport,
) -> Result<()> {
    let mut survivor = group.survivor.clone();
    let rows = store
        .messages_by_ids(&survivor.guild_id, &survivor.message_ids)
        .await?;
    survivor.order_messages(&rows);
    store.upsert_segment(&survivor).await?;
    report.merges += 1;

    for id in &group.absorbed {
        match delete_absorbed(store, &survivor.guild_id, *id).await {
            Ok(()) => report.segments_deleted += 1,
            Err(RapportError::ConsolidationConflict(id)) => {
                tracing::debug!("Segment {} already consolidated elsewhere", id);
                report.conflicts += 1;
            }
            Err(e) => return Err(e),
        }
        store.unlink_segment(&survivor.guild_id, *id).await?;
    }

    // Re-point every participant pair at the survivor
    for (i, a) in survivor.participants.iter().enumerate() {
        for b in &survivor.participants[i + 1..] {
            store
                .link_segment(
                    &survivor.guild_id,
                    a,
                    b,
                    survivor.id,
                    survivor.end_time,
                    config.max_pair_segments,
                )
                .await?;
        }
    }
    Ok(())
}

async fn delete_absorbed(store: &dyn RelationshipStore, guild_id: &str, id: Uuid) -> Result<()> {
    if store.delete_segment(guild_id, id).await? {
        Ok(())
    } else {
        Err(RapportError::ConsolidationConflict(id))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use rapport_core::models::SegmentFeatures;
    use rapport_core::store::MemoryStore;

    fn segment(first_msg: &str, start: i64, end: i64, participants: &[&str]) -> ConversationSegment {
        let base = DateTime::parse_from_rfc3339("2026-03-01T18:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut s = ConversationSegment {
            id: ConversationSegment::stable_id("g", "C", first_msg),
            guild_id: "g".into(),
            channel_id: "C".into(),
            participants: participants.iter().map(|p| p.to_string()).collect(),
            start_time: base + Duration::minutes(start),
            end_time: base + Duration::minutes(end),
            message_ids: vec![first_msg.to_string()],
            message_count: 0,
            features: SegmentFeatures::default(),
            summary: None,
        };
        s.refresh_derived();
        s
    }

    // ========================================================================
    // TEST 1: close segments sharing a participant merge into the earliest
    // ========================================================================
    #[test]
    fn test_plan_merges_pairs_up() {
        let a = segment("1", 0, 10, &["A", "B"]);
        let b = segment("2", 25, 30, &["B", "C"]);
        let groups = plan_merges(&[b.clone(), a.clone()], 30);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].survivor.id, a.id);
        assert_eq!(groups[0].absorbed, vec![b.id]);
        assert_eq!(groups[0].survivor.participants, vec!["A", "B", "C"]);
        assert_eq!(groups[0].survivor.message_ids, vec!["1", "2"]);
    }

    // ========================================================================
    // TEST 2: gap or disjoint participants prevent a merge
    // ========================================================================
    #[test]
    fn test_plan_merges_requires_gap_and_participant() {
        let a = segment("1", 0, 10, &["A", "B"]);
        let far = segment("2", 60, 70, &["A", "B"]);
        let strangers = segment("3", 12, 15, &["X", "Y"]);
        assert!(plan_merges(&[a, far, strangers], 30).is_empty());
    }

    // ========================================================================
    // TEST 3: transitive chains merge in one pass
    // ========================================================================
    #[test]
    fn test_plan_merges_transitive() {
        let a = segment("1", 0, 10, &["A", "B"]);
        let b = segment("2", 35, 40, &["B", "C"]);
        let c = segment("3", 60, 65, &["C", "D"]);
        let groups = plan_merges(&[a, b, c], 30);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].absorbed.len(), 2);
        assert_eq!(groups[0].survivor.participants, vec!["A", "B", "C", "D"]);
    }

    // ========================================================================
    // TEST 4: store-level run converges and relinks pairs
    // ========================================================================
    #[tokio::test]
    async fn test_consolidate_guild_converges() {
        let store = MemoryStore::new();
        let locks = KeyedLocks::new();
        let config = SegmentationConfig::default();
        let a = segment("1", 0, 10, &["A", "B"]);
        let b = segment("2", 20, 25, &["A", "B"]);
        let lone = segment("3", 200, 210, &["A", "B"]);
        for s in [&a, &b, &lone] {
            store.upsert_segment(s).await.unwrap();
        }

        let first = consolidate_guild(&store, &locks, &config, "g").await.unwrap();
        assert_eq!(first.merges, 1);
        assert_eq!(first.segments_deleted, 1);
        assert_eq!(first.segments_scanned, 3);

        let second = consolidate_guild(&store, &locks, &config, "g").await.unwrap();
        assert_eq!(second.merges, 0, "already consolidated guild is stable");
        assert_eq!(store.all_segments("g").len(), 2);

        let pair = store.pair("g", "A", "B").await.unwrap().unwrap();
        assert_eq!(pair.segment_ids[0], a.id);
    }

    // ========================================================================
    // TEST 5: a segment deleted underneath the run is a counted no-op
    // ========================================================================
    #[tokio::test]
    async fn test_concurrent_delete_is_conflict() {
        let store = MemoryStore::new();
        let a = segment("1", 0, 10, &["A", "B"]);
        let b = segment("2", 20, 25, &["A", "B"]);
        store.upsert_segment(&a).await.unwrap();

        let group = plan_merges(&[a, b], 30).remove(0);
        let mut report = ConsolidationReport::default();
        apply_merge(&store, &SegmentationConfig::default(), &group, &mut report)
            .await
            .unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.segments_deleted, 0);
        assert_eq!(report.merges, 1);
    }

    // ========================================================================
    // TEST 6: absorbed ids leave the pair evidence list
    // ========================================================================
    #[tokio::test]
    async fn test_merge_unlinks_absorbed_segments() {
        let store = MemoryStore::new();
        let config = SegmentationConfig::default();
        let a = segment("1", 0, 10, &["A", "B"]);
        let b = segment("2", 20, 25, &["A", "B"]);
        for s in [&a, &b] {
            store.upsert_segment(s).await.unwrap();
            store
                .link_segment("g", "A", "B", s.id, s.end_time, config.max_pair_segments)
                .await
                .unwrap();
        }

        consolidate_guild(&store, &KeyedLocks::new(), &config, "g")
            .await
            .unwrap();

        let pair = store.pair("g", "A", "B").await.unwrap().unwrap();
        assert_eq!(pair.segment_ids, vec![a.id]);
    }

    // ========================================================================
    // TEST 7: survivor messages end up in creation order
    // ========================================================================
    #[tokio::test]
    async fn test_merge_orders_messages_by_time() {
        let store = MemoryStore::new();
        let base = DateTime::parse_from_rfc3339("2026-03-01T18:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        for (id, author, minute) in [("1", "A", 0), ("3", "B", 2), ("2", "A", 4), ("4", "B", 6)] {
            store
                .log_message(&rapport_core::models::ChatMessage {
                    guild_id: "g".into(),
                    id: id.into(),
                    channel_id: "C".into(),
                    author_id: author.into(),
                    content: String::new(),
                    created_at: base + Duration::minutes(minute),
                    referenced_message_id: None,
                    is_bot: false,
                })
                .await
                .unwrap();
        }
        // Overlapping spans: "1".."3" and "2".."4"
        let mut first = segment("1", 0, 4, &["A", "B"]);
        first.message_ids = vec!["1".into(), "2".into()];
        first.refresh_derived();
        let mut second = segment("3", 2, 6, &["A", "B"]);
        second.message_ids = vec!["3".into(), "4".into()];
        second.refresh_derived();
        store.upsert_segment(&first).await.unwrap();
        store.upsert_segment(&second).await.unwrap();

        consolidate_guild(&store, &KeyedLocks::new(), &SegmentationConfig::default(), "g")
            .await
            .unwrap();

        let merged = store.all_segments("g");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].message_ids, vec!["1", "3", "2", "4"]);
    }
}
