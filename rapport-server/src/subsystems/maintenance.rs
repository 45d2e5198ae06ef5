//! Maintenance Scheduler: periodic batch upkeep per guild
//!
//! Every `interval_minutes`, unless the host is busy, each known guild gets:
//! 1. rolling-window recompute for every edge
//! 2. segment hygiene against the message log
//! 3. segment consolidation
//! 4. a guild-wide rollup of member networks
//!
//! A failing step is logged and the cycle moves on; each batch step keeps its
//! own checkpoint, so the next cycle resumes an interrupted sweep.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use rapport_core::config::MaintenanceConfig;

use super::consolidate::{self, ConsolidationReport};
use super::hygiene::{self, HygieneReport};
use super::rolling::{self, RollingReport};
use super::rollup;
use super::BatchReport;
use crate::engine::Engine;

// ============================================================================
// PUBLIC API
// ============================================================================

/// Report from one guild's maintenance cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub guild_id: String,
    pub rolling: Option<RollingReport>,
    pub hygiene: Option<HygieneReport>,
    pub consolidation: Option<ConsolidationReport>,
    pub rollup: BatchReport,
    pub errors: Vec<String>,
}

/// Run every maintenance step for one guild. Called by the loop and by the
/// `maintain` request.
pub async fn run_maintenance_cycle(
    engine: &Engine,
    guild_id: &str,
    now: DateTime<Utc>,
) -> MaintenanceReport {
    let store = engine.store();
    let config = engine.config();
    let mut report = MaintenanceReport {
        guild_id: guild_id.to_string(),
        ..Default::default()
    };

    let (cutoff_7d, cutoff_30d) = rolling::cutoffs_at(now);
    match rolling::update_edge_rolling_windows(
        store,
        &config.maintenance,
        guild_id,
        cutoff_7d,
        cutoff_30d,
    )
    .await
    {
        Ok(r) => report.rolling = Some(r),
        Err(e) => report.errors.push(format!("rolling windows: {}", e)),
    }

    match hygiene::clean_guild(store, engine.channel_locks(), guild_id).await {
        Ok(r) => report.hygiene = Some(r),
        Err(e) => report.errors.push(format!("hygiene: {}", e)),
    }

    match consolidate::consolidate_guild(
        store,
        engine.channel_locks(),
        &config.segmentation,
        guild_id,
    )
    .await
    {
        Ok(r) => report.consolidation = Some(r),
        Err(e) => report.errors.push(format!("consolidation: {}", e)),
    }

    report.rollup = rollup::rollup_guild(
        store,
        engine.network_locks(),
        &config.segmentation,
        &config.maintenance,
        guild_id,
    )
    .await;

    for e in &report.errors {
        tracing::warn!("Maintenance step failed for {}: {}", guild_id, e);
    }
    report
}

/// Called from main.rs to start the background maintenance loop
pub async fn run_maintenance_loop(engine: Arc<Engine>, mut shutdown: broadcast::Receiver<()>) {
    let config = engine.config().maintenance.clone();
    if !config.enabled {
        tracing::info!("Maintenance loop disabled");
        return;
    }

    let interval = tokio::time::Duration::from_secs(config.interval_minutes.max(1) * 60);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; give startup traffic room first
    ticker.tick().await;

    tracing::info!(
        "Maintenance loop started (interval: {}min)",
        config.interval_minutes
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if host_is_busy(&config) {
                    tracing::debug!("Maintenance skipped: host busy");
                    continue;
                }
                let guilds = match engine.store().guilds().await {
                    Ok(g) => g,
                    Err(e) => {
                        tracing::error!("Maintenance error: {}", e);
                        continue;
                    }
                };
                for guild_id in guilds {
                    let report = run_maintenance_cycle(&engine, &guild_id, chrono::Utc::now()).await;
                    tracing::info!(
                        "Maintenance for {} complete: {} members rolled up, {} step errors",
                        guild_id,
                        report.rollup.processed,
                        report.errors.len()
                    );
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Maintenance loop shutting down");
                break;
            }
        }
    }
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

/// 1-minute load average as a percentage of available cores (Linux only).
fn host_load_percent() -> Option<f32> {
    let load = std::fs::read_to_string("/proc/loadavg").ok()?;
    let load_1m: f32 = load.split_whitespace().next()?.parse().ok()?;
    let cpu_count = num_cpus::get().max(1) as f32;
    Some((load_1m / cpu_count) * 100.0)
}

fn host_is_busy(config: &MaintenanceConfig) -> bool {
    exceeds_threshold(host_load_percent(), config.cpu_threshold_percent)
}

fn exceeds_threshold(load_percent: Option<f32>, threshold_percent: u8) -> bool {
    load_percent.is_some_and(|pct| pct > threshold_percent as f32)
}

// ============================================================================
// TESTS
// ============================================================================
