//! Rolling-Window Maintainer
//!
//! Recomputes the 7-day and 30-day activity columns of every edge in a guild.
//! The windows are a coarse point-in-time gate, not a sliding count: an edge
//! whose last interaction falls inside the window reports its full lifetime
//! total, anything older reports 0.
//!
//! Edges are processed in keyset pages with a checkpoint after each page, so
//! an interrupted sweep resumes where it stopped.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use rapport_core::config::MaintenanceConfig;
use rapport_core::models::DirectedEdge;
use rapport_core::retry::{self, RetryPolicy};
use rapport_core::store::{decode_cursor, encode_cursor, PairCursor, RollingUpdate};
use rapport_core::{RelationshipStore, Result};

const JOB: &str = "rolling_windows";

// ============================================================================
// PUBLIC API
// ============================================================================

/// Report from a rolling-window sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollingReport {
    pub edges_scanned: usize,
    pub edges_updated: u64,
    pub batches: usize,
    pub resumed_from: Option<String>,
}

/// `(now - 7d, now - 30d)`
pub fn cutoffs_at(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (now - Duration::days(7), now - Duration::days(30))
}

/// Window values for one edge. Never exceed `total`, and the 7-day value never
/// exceeds the 30-day value even for inverted cutoffs.
pub fn rolling_windows(
    edge: &DirectedEdge,
    cutoff_7d: DateTime<Utc>,
    cutoff_30d: DateTime<Utc>,
) -> (i64, i64) {
    let total = edge.total.max(0);
    let r30 = if edge.last_interaction >= cutoff_30d { total } else { 0 };
    let r7 = if edge.last_interaction >= cutoff_7d { total } else { 0 };
    (r7.min(r30), r30)
}

/// Sweep every edge of a guild.
pub async fn update_edge_rolling_windows(
    store: &dyn RelationshipStore,
    config: &MaintenanceConfig,
    guild_id: &str,
    cutoff_7d: DateTime<Utc>,
    cutoff_30d: DateTime<Utc>,
) -> Result<RollingReport> {
    let mut report = RollingReport::default();
    let policy = RetryPolicy {
        attempts: config.retry_attempts,
        base_delay_ms: config.retry_delay_ms,
    };
    let batch_size = config.batch_size.max(1);

    let raw = store.load_checkpoint(JOB, guild_id).await?;
    let mut cursor: Option<PairCursor> = raw.as_deref().and_then(decode_cursor);
    report.resumed_from = raw;

    loop {
        let after = cursor.as_ref();
        let page = retry::with_backoff(policy, || store.edges_after(guild_id, after, batch_size)).await?;
        let Some(last) = page.last() else {
            break;
        };
        let next: PairCursor = (last.user_a.clone(), last.user_b.clone());
        report.batches += 1;
        report.edges_scanned += page.len();

        let updates: Vec<RollingUpdate> = page
            .iter()
            .filter_map(|edge| {
                let (rolling_7d, rolling_30d) = rolling_windows(edge, cutoff_7d, cutoff_30d);
                (rolling_7d != edge.rolling_7d || rolling_30d != edge.rolling_30d).then(|| {
                    RollingUpdate {
                        user_a: edge.user_a.clone(),
                        user_b: edge.user_b.clone(),
                        rolling_7d,
                        rolling_30d,
                    }
                })
            })
            .collect();

        if !updates.is_empty() {
            report.edges_updated +=
                retry::with_backoff(policy, || store.set_rolling_windows(guild_id, &updates)).await?;
        }

        store
            .save_checkpoint(JOB, guild_id, &encode_cursor(&next))
            .await?;
        cursor = Some(next);

        if page.len() < batch_size as usize {
            break;
        }
    }

    store.clear_checkpoint(JOB, guild_id).await?;
    tracing::debug!(
        "Rolling windows for {}: {} edges scanned, {} updated",
        guild_id,
        report.edges_scanned,
        report.edges_updated
    );
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_core::models::{InteractionEvent, InteractionKind};
    use rapport_core::store::MemoryStore;

    fn edge_at(last: DateTime<Utc>, total: i64) -> DirectedEdge {
        let event = InteractionEvent::new("g", "a", "b", InteractionKind::Message, last).unwrap();
        let mut edge = DirectedEdge::empty_for(&event);
        edge.total = total;
        edge
    }

    // ========================================================================
    // TEST 1: recent edge counts in both windows
    // ========================================================================
    #[test]
    fn test_recent_edge_in_both_windows() {
        let now = Utc::now();
        let (c7, c30) = cutoffs_at(now);
        assert_eq!(rolling_windows(&edge_at(now - Duration::days(1), 9), c7, c30), (9, 9));
    }

    // ========================================================================
    // TEST 2: between 7 and 30 days only the 30-day window counts
    // ========================================================================
    #[test]
    fn test_mid_age_edge() {
        let now = Utc::now();
        let (c7, c30) = cutoffs_at(now);
        assert_eq!(rolling_windows(&edge_at(now - Duration::days(10), 4), c7, c30), (0, 4));
        assert_eq!(rolling_windows(&edge_at(now - Duration::days(45), 4), c7, c30), (0, 0));
    }

    // ========================================================================
    // TEST 3: inverted cutoffs still keep rolling_7d <= rolling_30d
    // ========================================================================
    #[test]
    fn test_inverted_cutoffs_preserve_ordering() {
        let now = Utc::now();
        let edge = edge_at(now - Duration::days(10), 4);
        let (r7, r30) = rolling_windows(&edge, now - Duration::days(30), now - Duration::days(7));
        assert!(r7 <= r30);
        assert!(r30 <= edge.total);
    }

    // ========================================================================
    // TEST 4: store sweep over several pages keeps the invariants
    // ========================================================================
    #[tokio::test]
    async fn test_sweep_invariants() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ages = [1, 3, 8, 15, 29, 31, 90];
        for (i, days) in ages.iter().enumerate() {
            let event = InteractionEvent::new(
                "g",
                &format!("u{}", i),
                &format!("v{}", i),
                InteractionKind::Reply,
                now - Duration::days(*days),
            )
            .unwrap();
            store.increment_edge(&event).await.unwrap();
        }

        let config = MaintenanceConfig {
            batch_size: 3,
            retry_delay_ms: 1,
            ..MaintenanceConfig::default()
        };
        let (c7, c30) = cutoffs_at(now);
        let report = update_edge_rolling_windows(&store, &config, "g", c7, c30)
            .await
            .unwrap();
        assert_eq!(report.edges_scanned, 7);
        assert_eq!(report.batches, 3);
        assert_eq!(report.edges_updated, 5);

        for edge in store.all_edges("g") {
            assert!(edge.rolling_7d <= edge.total);
            assert!(edge.rolling_30d <= edge.total);
            assert!(edge.rolling_7d <= edge.rolling_30d);
        }
        let recent: i64 = store.all_edges("g").iter().map(|e| e.rolling_7d).sum();
        assert_eq!(recent, 2);
        assert!(store.load_checkpoint(JOB, "g").await.unwrap().is_none());

        // A second sweep with the same cutoffs changes nothing
        let again = update_edge_rolling_windows(&store, &config, "g", c7, c30)
            .await
            .unwrap();
        assert_eq!(again.edges_updated, 0);
    }
}
