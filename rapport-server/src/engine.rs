//! Shared engine handle
//!
//! One `Engine` per process, shared by the IPC server, the HTTP API and the
//! maintenance loop. It owns the only in-process state: the recorder's
//! proximity windows and the keyed lock tables.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use rapport_core::models::{IncomingMessage, IncomingReaction, Member, MemberRelationshipEntry};
use rapport_core::{KeyedLocks, RapportConfig, RelationshipStore, Result, RetryPolicy};

use crate::subsystems::maintenance::{self, MaintenanceReport};
use crate::subsystems::recorder::{InteractionRecorder, RecordOutcome};
use crate::subsystems::rollup::{self, MemberKey};
use crate::subsystems::segmenter::{self, ChannelKey};
use crate::subsystems::BatchReport;

pub struct Engine {
    store: Arc<dyn RelationshipStore>,
    config: RapportConfig,
    recorder: InteractionRecorder,
    network_locks: KeyedLocks<MemberKey>,
    channel_locks: KeyedLocks<ChannelKey>,
}

/// Ingest result: recorder outcome plus the segment the message landed in.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestOutcome {
    #[serde(flatten)]
    pub recorded: RecordOutcome,
    pub segment_id: Option<Uuid>,
}

impl Engine {
    pub fn new(store: Arc<dyn RelationshipStore>, config: RapportConfig) -> Self {
        Self {
            recorder: InteractionRecorder::new(&config.recorder),
            store,
            config,
            network_locks: KeyedLocks::new(),
            channel_locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &dyn RelationshipStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &RapportConfig {
        &self.config
    }

    pub fn recorder(&self) -> &InteractionRecorder {
        &self.recorder
    }

    pub fn network_locks(&self) -> &KeyedLocks<MemberKey> {
        &self.network_locks
    }

    pub fn channel_locks(&self) -> &KeyedLocks<ChannelKey> {
        &self.channel_locks
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.config.maintenance.retry_attempts,
            base_delay_ms: self.config.maintenance.retry_delay_ms,
        }
    }

    pub async fn upsert_member(&self, member: &Member) -> Result<()> {
        self.store.upsert_member(member).await
    }

    /// Live message path: record interactions, then fold into a segment.
    /// Segmentation failures are logged and dropped like recorder failures.
    pub async fn ingest_message(&self, message: IncomingMessage) -> Result<IngestOutcome> {
        let recorded = self.recorder.record_message(self.store(), message).await?;

        let segment_id = match &recorded.message {
            Some(logged) => {
                match segmenter::extend_or_open(
                    self.store(),
                    &self.channel_locks,
                    &self.config.segmentation,
                    logged,
                    &recorded.partners,
                )
                .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::warn!("Segmenting message {} failed: {}", logged.id, e);
                        None
                    }
                }
            }
            None => None,
        };

        Ok(IngestOutcome {
            recorded,
            segment_id,
        })
    }

    pub async fn ingest_reaction(&self, reaction: &IncomingReaction) -> Result<bool> {
        self.recorder.record_reaction(self.store(), reaction).await
    }

    pub async fn rollup_member(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Vec<MemberRelationshipEntry>> {
        rollup::rollup_edges_to_member_network(
            self.store(),
            &self.network_locks,
            &self.config.segmentation,
            guild_id,
            user_id,
        )
        .await
    }

    pub async fn rollup_guild(&self, guild_id: &str) -> BatchReport {
        rollup::rollup_guild(
            self.store(),
            &self.network_locks,
            &self.config.segmentation,
            &self.config.maintenance,
            guild_id,
        )
        .await
    }

    pub async fn backfill_guild(&self, guild_id: &str) -> BatchReport {
        segmenter::backfill_guild(
            self.store(),
            &self.channel_locks,
            &self.config.segmentation,
            &self.config.maintenance,
            guild_id,
        )
        .await
    }

    pub async fn maintain(&self, guild_id: &str) -> MaintenanceReport {
        maintenance::run_maintenance_cycle(self, guild_id, Utc::now()).await
    }

    /// Remove every derived row and in-process window for a guild.
    pub async fn purge_guild(&self, guild_id: &str) -> Result<u64> {
        let removed = rapport_core::retry::with_backoff(self.retry_policy(), || {
            self.store.purge_guild(guild_id)
        })
        .await?;
        self.recorder.window().forget_guild(guild_id);
        tracing::info!("Purged {} edges for guild {}", removed, guild_id);
        Ok(removed)
    }
}
