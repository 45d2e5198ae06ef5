//! Interaction Recorder: live message/reaction path
//!
//! Turns one chat event into edge increments:
//! - mention: author → each mentioned, known, non-bot member
//! - reply: author → the referenced message's author
//! - proximity: author ↔ each distinct partner in the channel window, one
//!   `message` increment each way (the reciprocal at the partner's own time)
//! - reaction: reactor → message author
//!
//! Bot authors produce nothing and are not logged. Individual increment
//! failures are logged and dropped; the outcome reports how many landed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use rapport_core::config::RecorderConfig;
use rapport_core::models::{
    ChatMessage, IncomingMessage, IncomingReaction, InteractionEvent, InteractionKind,
};
use rapport_core::{RapportError, RelationshipStore, Result};

use super::mentions;
use super::proximity::{ProximityWindow, RecentMessage};

// ============================================================================
// PUBLIC API
// ============================================================================

/// What one ingested message produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordOutcome {
    /// False for bot authors and replays of an already-logged message
    pub accepted: bool,
    pub mentions: usize,
    pub replies: usize,
    pub proximity: usize,
    pub failures: usize,
    #[serde(skip)]
    pub message: Option<ChatMessage>,
    #[serde(skip)]
    pub partners: Vec<RecentMessage>,
}

impl RecordOutcome {
    pub fn interactions(&self) -> usize {
        self.mentions + self.replies + self.proximity
    }
}

/// Record one interaction: bump the edge counter for `kind` and touch the pair
/// cache. Self-interactions are ignored with `Ok(false)`.
pub async fn record_interaction(
    store: &dyn RelationshipStore,
    guild_id: &str,
    from_user: &str,
    to_user: &str,
    kind: InteractionKind,
    timestamp: DateTime<Utc>,
) -> Result<bool> {
    let event = match InteractionEvent::new(guild_id, from_user, to_user, kind, timestamp) {
        Ok(event) => event,
        Err(RapportError::InvalidPair(reason)) => {
            tracing::debug!("Ignoring {} interaction: {}", kind.as_str(), reason);
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    store.increment_edge(&event).await?;
    store.touch_pair(&event).await?;
    Ok(true)
}

#[derive(Debug)]
pub struct InteractionRecorder {
    window: ProximityWindow,
}

impl InteractionRecorder {
    pub fn new(config: &RecorderConfig) -> Self {
        Self {
            window: ProximityWindow::new(config),
        }
    }

    pub fn window(&self) -> &ProximityWindow {
        &self.window
    }

    /// Apply the detection policy to one incoming message.
    pub async fn record_message(
        &self,
        store: &dyn RelationshipStore,
        incoming: IncomingMessage,
    ) -> Result<RecordOutcome> {
        let mut outcome = RecordOutcome::default();

        // Unknown authors are treated as humans; the directory may lag the event stream
        let author = store.member(&incoming.guild_id, &incoming.author_id).await?;
        if author.as_ref().is_some_and(|m| m.is_bot) {
            tracing::debug!(
                "Skipping bot message {} in {}",
                incoming.message_id,
                incoming.channel_id
            );
            return Ok(outcome);
        }

        let explicit_mentions = incoming.mention_ids.clone();
        let message = incoming.into_logged(false);

        if !store.log_message(&message).await? {
            tracing::debug!("Message {} already recorded, skipping", message.id);
            return Ok(outcome);
        }
        outcome.accepted = true;

        self.record_mentions(store, &message, &explicit_mentions, &mut outcome)
            .await;
        self.record_reply(store, &message, &mut outcome).await;

        let partners = self.window.observe(
            &message.guild_id,
            &message.channel_id,
            RecentMessage {
                message_id: message.id.clone(),
                author_id: message.author_id.clone(),
                created_at: message.created_at,
            },
        );
        self.record_proximity(store, &message, &partners, &mut outcome)
            .await;

        if outcome.failures > 0 {
            tracing::warn!(
                "Message {}: {} interactions recorded, {} dropped",
                message.id,
                outcome.interactions(),
                outcome.failures
            );
        }

        outcome.partners = partners;
        outcome.message = Some(message);
        Ok(outcome)
    }

    /// One `reaction` reactor → author when both are distinct humans.
    pub async fn record_reaction(
        &self,
        store: &dyn RelationshipStore,
        reaction: &IncomingReaction,
    ) -> Result<bool> {
        let Some(target) = store.message(&reaction.guild_id, &reaction.message_id).await? else {
            tracing::debug!("Reaction on unknown message {}", reaction.message_id);
            return Ok(false);
        };
        if target.is_bot || target.author_id == reaction.reactor_id {
            return Ok(false);
        }
        if is_bot(store, &reaction.guild_id, &reaction.reactor_id).await? {
            return Ok(false);
        }

        record_interaction(
            store,
            &reaction.guild_id,
            &reaction.reactor_id,
            &target.author_id,
            InteractionKind::Reaction,
            reaction.created_at,
        )
        .await
    }
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

impl InteractionRecorder {
    async fn record_mentions(
        &self,
        store: &dyn RelationshipStore,
        message: &ChatMessage,
        explicit: &[String],
        outcome: &mut RecordOutcome,
    ) {
        for mentioned in mentions::collect_mentions(explicit, &message.content) {
            if mentioned == message.author_id {
                continue;
            }
            match store.member(&message.guild_id, &mentioned).await {
                Ok(Some(member)) if !member.is_bot => {}
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Mention lookup failed for {}: {}", mentioned, e);
                    outcome.failures += 1;
                    continue;
                }
            }
            let written = record_interaction(
                store,
                &message.guild_id,
                &message.author_id,
                &mentioned,
                InteractionKind::Mention,
                message.created_at,
            )
            .await;
            tally(written, &mut outcome.mentions, &mut outcome.failures, "mention");
        }
    }

    async fn record_reply(
        &self,
        store: &dyn RelationshipStore,
        message: &ChatMessage,
        outcome: &mut RecordOutcome,
    ) {
        let Some(referenced) = message.referenced_message_id.as_deref() else {
            return;
        };
        let prior = match store.message(&message.guild_id, referenced).await {
            Ok(Some(prior)) => prior,
            Ok(None) => {
                tracing::debug!("Reply target {} not in message log", referenced);
                return;
            }
            Err(e) => {
                tracing::warn!("Reply lookup failed for {}: {}", referenced, e);
                outcome.failures += 1;
                return;
            }
        };
        if prior.is_bot || prior.author_id == message.author_id {
            return;
        }
        let written = record_interaction(
            store,
            &message.guild_id,
            &message.author_id,
            &prior.author_id,
            InteractionKind::Reply,
            message.created_at,
        )
        .await;
        tally(written, &mut outcome.replies, &mut outcome.failures, "reply");
    }

    async fn record_proximity(
        &self,
        store: &dyn RelationshipStore,
        message: &ChatMessage,
        partners: &[RecentMessage],
        outcome: &mut RecordOutcome,
    ) {
        for partner in partners {
            let forward = record_interaction(
                store,
                &message.guild_id,
                &message.author_id,
                &partner.author_id,
                InteractionKind::Message,
                message.created_at,
            )
            .await;
            tally(forward, &mut outcome.proximity, &mut outcome.failures, "proximity");

            let reciprocal = record_interaction(
                store,
                &message.guild_id,
                &partner.author_id,
                &message.author_id,
                InteractionKind::Message,
                partner.created_at,
            )
            .await;
            tally(reciprocal, &mut outcome.proximity, &mut outcome.failures, "proximity");
        }
    }
}

fn tally(result: Result<bool>, written: &mut usize, failures: &mut usize, kind: &str) {
    match result {
        Ok(true) => *written += 1,
        Ok(false) => {}
        Err(e) => {
            tracing::warn!("Dropping {} interaction: {}", kind, e);
            *failures += 1;
        }
    }
}

async fn is_bot(store: &dyn RelationshipStore, guild_id: &str, user_id: &str) -> Result<bool> {
    Ok(store
        .member(guild_id, user_id)
        .await?
        .is_some_and(|m| m.is_bot))
}

// ============================================================================
// TESTS
// ============================================================================
