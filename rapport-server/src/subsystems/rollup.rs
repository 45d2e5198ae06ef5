//! Rollup Engine: edges → ranked per-member relationship network
//!
//! For one member: every edge touching them contributes its `total` as that
//! neighbor's share; shares are apportioned to 100 points with the largest
//! remainder method, ranked, decorated with the pair's most recent
//! conversations and written back as a whole-network replacement.
//!
//! Read-compute-replace is serialized per (guild, user) in-process; the
//! PostgreSQL store additionally takes an advisory lock for the replace.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use rapport_core::affinity;
use rapport_core::config::{MaintenanceConfig, SegmentationConfig};
use rapport_core::models::{DirectedEdge, MemberRelationshipEntry};
use rapport_core::retry::{self, RetryPolicy};
use rapport_core::{KeyedLocks, RapportError, RelationshipStore, Result};

use super::BatchReport;

const JOB: &str = "rollup";

pub type MemberKey = (String, String);

// ============================================================================
// PUBLIC API
// ============================================================================

/// Recompute and persist one member's relationship network.
pub async fn rollup_edges_to_member_network(
    store: &dyn RelationshipStore,
    locks: &KeyedLocks<MemberKey>,
    config: &SegmentationConfig,
    guild_id: &str,
    user_id: &str,
) -> Result<Vec<MemberRelationshipEntry>> {
    let _guard = locks
        .lock((guild_id.to_string(), user_id.to_string()))
        .await;

    if store.member(guild_id, user_id).await?.is_none() {
        return Err(RapportError::MemberNotFound {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
        });
    }

    let edges = store.edges_for_member(guild_id, user_id).await?;
    let mut network = build_network(user_id, &edges);

    if config.max_entry_conversations > 0 {
        for entry in network.iter_mut() {
            if let Some(pair) = store.pair(guild_id, user_id, &entry.user_id).await? {
                if !pair.segment_ids.is_empty() {
                    entry.conversations = Some(
                        pair.segment_ids
                            .iter()
                            .take(config.max_entry_conversations)
                            .copied()
                            .collect(),
                    );
                }
            }
        }
    }

    store
        .replace_relationship_network(guild_id, user_id, &network)
        .await?;

    tracing::debug!(
        "Rolled up {} neighbors for {} in {}",
        network.len(),
        user_id,
        guild_id
    );
    Ok(network)
}

/// Pure network computation over the edges touching `user_id`.
/// Empty when the member has no interaction volume.
pub fn build_network(user_id: &str, edges: &[DirectedEdge]) -> Vec<MemberRelationshipEntry> {
    let mut neighbors: BTreeMap<&str, (i64, DateTime<Utc>)> = BTreeMap::new();
    for edge in edges {
        let Some(other) = edge.other(user_id) else {
            continue;
        };
        if other == user_id || edge.total <= 0 {
            continue;
        }
        let slot = neighbors
            .entry(other)
            .or_insert((0, edge.last_interaction));
        slot.0 += edge.total;
        slot.1 = slot.1.max(edge.last_interaction);
    }

    let shares: Vec<i64> = neighbors.values().map(|(total, _)| *total).collect();
    let points = affinity::share_of_total(&shares);

    let mut network: Vec<MemberRelationshipEntry> = neighbors
        .into_iter()
        .zip(points)
        .map(|((neighbor, (total, last)), pct)| {
            MemberRelationshipEntry::new(neighbor, pct, total, last)
        })
        .collect();
    affinity::rank(&mut network);
    network
}

/// Roll up every member of a guild in checkpointed chunks. Per-member errors
/// are collected, never fatal to the run.
pub async fn rollup_guild(
    store: &dyn RelationshipStore,
    locks: &KeyedLocks<MemberKey>,
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

    let mut cursor = match store.load_checkpoint(JOB, guild_id).await {
        Ok(cursor) => cursor,
        Err(e) => {
            report.record_error("checkpoint", e);
            None
        }
    };
    report.resumed_from = cursor.clone();
    if let Some(from) = &cursor {
        tracing::info!("Resuming rollup for {} after member {}", guild_id, from);
    }

    loop {
        let after = cursor.as_deref();
        let page = match retry::with_backoff(policy, || {
            store.members_after(guild_id, after, batch_size)
        })
        .await
        {
            Ok(page) => page,
            Err(e) => {
                report.record_error("members page", e);
                return report;
            }
        };
        let Some(last) = page.last() else {
            break;
        };
        let last_user = last.user_id.clone();
        report.batches += 1;

        for member in &page {
            let result = retry::with_backoff(policy, || {
                rollup_edges_to_member_network(
                    store,
                    locks,
                    segmentation,
                    guild_id,
                    &member.user_id,
                )
            })
            .await;
            match result {
                Ok(_) => report.processed += 1,
                Err(e) => {
                    tracing::warn!("Rollup failed for {} in {}: {}", member.user_id, guild_id, e);
                    report.record_error(&member.user_id, e);
                }
            }
        }

        if let Err(e) = store.save_checkpoint(JOB, guild_id, &last_user).await {
            report.record_error("checkpoint", e);
        }
        cursor = Some(last_user);

        if page.len() < batch_size as usize {
            break;
        }
    }

    if let Err(e) = store.clear_checkpoint(JOB, guild_id).await {
        report.record_error("checkpoint", e);
    }

    tracing::info!(
        "Rollup for {}: {} members in {} batches, {} failed",
        guild_id,
        report.processed,
        report.batches,
        report.failed
    );
    report
}

// ============================================================================
// TESTS
// ============================================================================
