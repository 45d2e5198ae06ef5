//! In-memory `RelationshipStore` for engine tests
//!
//! Mirrors the PostgreSQL semantics: one edge row per unordered pair, max()
//! timestamps, bounded pair segment lists, whole-network replacement.
//! `fail_next` / `fail_after` inject `StorageUnavailable` errors for
//! failure-path tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{PairCursor, RelationshipStore, RollingUpdate};
use crate::error::{RapportError, Result};
use crate::models::{
    pair, ChatMessage, ConversationSegment, DirectedEdge, InteractionEvent, Member,
    MemberRelationshipEntry, UndirectedPair,
};

type GuildKey = (String, String);
type PairKey = (String, String, String);

#[derive(Default)]
struct State {
    members: BTreeMap<GuildKey, Member>,
    networks: HashMap<GuildKey, Vec<MemberRelationshipEntry>>,
    /// Keyed by (guild, user_a, user_b) in first-write orientation
    edges: BTreeMap<PairKey, DirectedEdge>,
    pairs: BTreeMap<PairKey, UndirectedPair>,
    messages: BTreeMap<GuildKey, ChatMessage>,
    segments: BTreeMap<Uuid, ConversationSegment>,
    checkpoints: HashMap<GuildKey, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failures: AtomicUsize,
    pass_before_failing: AtomicUsize,
    network_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store calls fail with `StorageUnavailable`.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Let `pass` store calls through, then fail the following `n`.
    pub fn fail_after(&self, pass: usize, n: usize) {
        self.pass_before_failing.store(pass, Ordering::SeqCst);
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of successful network replacements so far.
    pub fn network_writes(&self) -> usize {
        self.network_writes.load(Ordering::SeqCst)
    }

    pub fn all_edges(&self, guild_id: &str) -> Vec<DirectedEdge> {
        self.lock()
            .edges
            .values()
            .filter(|e| e.guild_id == guild_id)
            .cloned()
            .collect()
    }

    pub fn all_segments(&self, guild_id: &str) -> Vec<ConversationSegment> {
        let mut segments: Vec<ConversationSegment> = self
            .lock()
            .segments
            .values()
            .filter(|s| s.guild_id == guild_id)
            .cloned()
            .collect();
        segments.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        segments
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<()> {
        let passed = self
            .pass_before_failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if passed.is_ok() {
            return Ok(());
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(RapportError::StorageUnavailable(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn edge_key(state: &State, guild_id: &str, x: &str, y: &str) -> Option<PairKey> {
        let forward = (guild_id.to_string(), x.to_string(), y.to_string());
        if state.edges.contains_key(&forward) {
            return Some(forward);
        }
        let reverse = (guild_id.to_string(), y.to_string(), x.to_string());
        state.edges.contains_key(&reverse).then_some(reverse)
    }

    fn pair_key(guild_id: &str, x: &str, y: &str) -> Result<PairKey> {
        let (u_min, u_max) = pair::ordered(x, y)?;
        Ok((guild_id.to_string(), u_min.to_string(), u_max.to_string()))
    }
}

#[async_trait]
impl RelationshipStore for MemoryStore {
    async fn upsert_member(&self, member: &Member) -> Result<()> {
        self.check()?;
        let key = (member.guild_id.clone(), member.user_id.clone());
        let mut state = self.lock();
        state.networks.entry(key.clone()).or_default();
        state.members.insert(key, member.clone());
        Ok(())
    }

    async fn member(&self, guild_id: &str, user_id: &str) -> Result<Option<Member>> {
        self.check()?;
        let key = (guild_id.to_string(), user_id.to_string());
        Ok(self.lock().members.get(&key).cloned())
    }

    async fn members_after(
        &self,
        guild_id: &str,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Member>> {
        self.check()?;
        let after = after.unwrap_or("");
        Ok(self
            .lock()
            .members
            .values()
            .filter(|m| m.guild_id == guild_id && m.user_id.as_str() > after)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn relationship_network(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Option<Vec<MemberRelationshipEntry>>> {
        self.check()?;
        let key = (guild_id.to_string(), user_id.to_string());
        let state = self.lock();
        if !state.members.contains_key(&key) {
            return Ok(None);
        }
        Ok(Some(state.networks.get(&key).cloned().unwrap_or_default()))
    }

    async fn replace_relationship_network(
        &self,
        guild_id: &str,
        user_id: &str,
        entries: &[MemberRelationshipEntry],
    ) -> Result<()> {
        self.check()?;
        let key = (guild_id.to_string(), user_id.to_string());
        let mut state = self.lock();
        if !state.members.contains_key(&key) {
            return Err(RapportError::MemberNotFound {
                guild_id: guild_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        state.networks.insert(key, entries.to_vec());
        self.network_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn increment_edge(&self, event: &InteractionEvent) -> Result<DirectedEdge> {
        self.check()?;
        let mut state = self.lock();
        let key = Self::edge_key(&state, &event.guild_id, &event.from_user, &event.to_user)
            .unwrap_or_else(|| {
                (
                    event.guild_id.clone(),
                    event.from_user.clone(),
                    event.to_user.clone(),
                )
            });
        let edge = state
            .edges
            .entry(key)
            .or_insert_with(|| DirectedEdge::empty_for(event));
        edge.apply(event);
        Ok(edge.clone())
    }

    async fn edge_between(&self, guild_id: &str, x: &str, y: &str) -> Result<Option<DirectedEdge>> {
        self.check()?;
        let state = self.lock();
        Ok(Self::edge_key(&state, guild_id, x, y).and_then(|k| state.edges.get(&k).cloned()))
    }

    async fn edges_for_member(&self, guild_id: &str, user_id: &str) -> Result<Vec<DirectedEdge>> {
        self.check()?;
        Ok(self
            .lock()
            .edges
            .values()
            .filter(|e| e.guild_id == guild_id && e.touches(user_id))
            .cloned()
            .collect())
    }

    async fn edges_after(
        &self,
        guild_id: &str,
        after: Option<&PairCursor>,
        limit: u32,
    ) -> Result<Vec<DirectedEdge>> {
        self.check()?;
        let state = self.lock();
        Ok(state
            .edges
            .iter()
            .filter(|((g, a, b), _)| {
                g == guild_id
                    && after.map_or(true, |(ca, cb)| (a.as_str(), b.as_str()) > (ca.as_str(), cb.as_str()))
            })
            .take(limit as usize)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn set_rolling_windows(&self, guild_id: &str, updates: &[RollingUpdate]) -> Result<u64> {
        self.check()?;
        let mut state = self.lock();
        let mut touched = 0;
        for u in updates {
            let key = (guild_id.to_string(), u.user_a.clone(), u.user_b.clone());
            if let Some(edge) = state.edges.get_mut(&key) {
                edge.rolling_7d = u.rolling_7d.min(edge.total);
                edge.rolling_30d = u.rolling_30d.min(edge.total);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn touch_pair(&self, event: &InteractionEvent) -> Result<()> {
        self.check()?;
        let key = Self::pair_key(&event.guild_id, &event.from_user, &event.to_user)?;
        let fresh = UndirectedPair::new(
            &event.guild_id,
            &event.from_user,
            &event.to_user,
            event.timestamp,
        )?;
        let mut state = self.lock();
        state
            .pairs
            .entry(key)
            .or_insert(fresh)
            .record(event.timestamp);
        Ok(())
    }

    async fn pair(&self, guild_id: &str, x: &str, y: &str) -> Result<Option<UndirectedPair>> {
        self.check()?;
        let key = Self::pair_key(guild_id, x, y)?;
        Ok(self.lock().pairs.get(&key).cloned())
    }

    async fn pairs_after(
        &self,
        guild_id: &str,
        after: Option<&PairCursor>,
        limit: u32,
    ) -> Result<Vec<UndirectedPair>> {
        self.check()?;
        let state = self.lock();
        Ok(state
            .pairs
            .iter()
            .filter(|((g, a, b), _)| {
                g == guild_id
                    && after.map_or(true, |(ca, cb)| (a.as_str(), b.as_str()) > (ca.as_str(), cb.as_str()))
            })
            .take(limit as usize)
            .map(|(_, p)| p.clone())
            .collect())
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
        self.check()?;
        let key = Self::pair_key(guild_id, x, y)?;
        let fresh = UndirectedPair::new(guild_id, x, y, at)?;
        let mut state = self.lock();
        state
            .pairs
            .entry(key)
            .or_insert(fresh)
            .link_segment(segment_id, cap);
        Ok(())
    }

    async fn unlink_segment(&self, guild_id: &str, segment_id: Uuid) -> Result<u64> {
        self.check()?;
        let mut state = self.lock();
        let mut touched = 0;
        for pair in state.pairs.values_mut().filter(|p| p.guild_id == guild_id) {
            let before = pair.segment_ids.len();
            pair.segment_ids.retain(|id| *id != segment_id);
            if pair.segment_ids.len() != before {
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn log_message(&self, message: &ChatMessage) -> Result<bool> {
        self.check()?;
        let key = (message.guild_id.clone(), message.id.clone());
        let mut state = self.lock();
        if state.messages.contains_key(&key) {
            return Ok(false);
        }
        state.messages.insert(key, message.clone());
        Ok(true)
    }

    async fn message(&self, guild_id: &str, message_id: &str) -> Result<Option<ChatMessage>> {
        self.check()?;
        let key = (guild_id.to_string(), message_id.to_string());
        Ok(self.lock().messages.get(&key).cloned())
    }

    async fn messages_by_ids(&self, guild_id: &str, ids: &[String]) -> Result<Vec<ChatMessage>> {
        self.check()?;
        let state = self.lock();
        let mut found: Vec<ChatMessage> = ids
            .iter()
            .filter_map(|id| state.messages.get(&(guild_id.to_string(), id.clone())).cloned())
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found.dedup_by(|a, b| a.id == b.id);
        Ok(found)
    }

    async fn messages_between(&self, guild_id: &str, x: &str, y: &str) -> Result<Vec<ChatMessage>> {
        self.check()?;
        let mut found: Vec<ChatMessage> = self
            .lock()
            .messages
            .values()
            .filter(|m| {
                m.guild_id == guild_id && !m.is_bot && (m.author_id == x || m.author_id == y)
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn upsert_segment(&self, segment: &ConversationSegment) -> Result<()> {
        self.check()?;
        let mut state = self.lock();
        let mut next = segment.clone();
        if next.summary.is_none() {
            if let Some(existing) = state.segments.get(&segment.id) {
                next.summary = existing.summary.clone();
            }
        }
        state.segments.insert(segment.id, next);
        Ok(())
    }

    async fn delete_segment(&self, guild_id: &str, segment_id: Uuid) -> Result<bool> {
        self.check()?;
        let mut state = self.lock();
        match state.segments.get(&segment_id) {
            Some(s) if s.guild_id == guild_id => {
                state.segments.remove(&segment_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn segments_by_ids(&self, guild_id: &str, ids: &[Uuid]) -> Result<Vec<ConversationSegment>> {
        self.check()?;
        let state = self.lock();
        let mut found: Vec<ConversationSegment> = ids
            .iter()
            .filter_map(|id| state.segments.get(id))
            .filter(|s| s.guild_id == guild_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(found)
    }

    async fn segment_channels(&self, guild_id: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut channels: Vec<String> = self
            .lock()
            .segments
            .values()
            .filter(|s| s.guild_id == guild_id)
            .map(|s| s.channel_id.clone())
            .collect();
        channels.sort();
        channels.dedup();
        Ok(channels)
    }

    async fn segments_in_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Vec<ConversationSegment>> {
        self.check()?;
        let mut found: Vec<ConversationSegment> = self
            .lock()
            .segments
            .values()
            .filter(|s| s.guild_id == guild_id && s.channel_id == channel_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn latest_segment_in_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Option<ConversationSegment>> {
        self.check()?;
        Ok(self
            .lock()
            .segments
            .values()
            .filter(|s| s.guild_id == guild_id && s.channel_id == channel_id)
            .max_by_key(|s| s.end_time)
            .cloned())
    }

    async fn load_checkpoint(&self, job: &str, guild_id: &str) -> Result<Option<String>> {
        self.check()?;
        let key = (job.to_string(), guild_id.to_string());
        Ok(self.lock().checkpoints.get(&key).cloned())
    }

    async fn save_checkpoint(&self, job: &str, guild_id: &str, cursor: &str) -> Result<()> {
        self.check()?;
        let key = (job.to_string(), guild_id.to_string());
        self.lock().checkpoints.insert(key, cursor.to_string());
        Ok(())
    }

    async fn clear_checkpoint(&self, job: &str, guild_id: &str) -> Result<()> {
        self.check()?;
        let key = (job.to_string(), guild_id.to_string());
        self.lock().checkpoints.remove(&key);
        Ok(())
    }

    async fn guilds(&self) -> Result<Vec<String>> {
        self.check()?;
        let mut guilds: Vec<String> = self.lock().members.keys().map(|(g, _)| g.clone()).collect();
        guilds.dedup();
        Ok(guilds)
    }

    async fn purge_guild(&self, guild_id: &str) -> Result<u64> {
        self.check()?;
        let mut state = self.lock();
        let before = state.edges.len();
        state.edges.retain(|(g, _, _), _| g != guild_id);
        let removed = (before - state.edges.len()) as u64;
        state.pairs.retain(|(g, _, _), _| g != guild_id);
        state.messages.retain(|(g, _), _| g != guild_id);
        state.segments.retain(|_, s| s.guild_id != guild_id);
        state.checkpoints.retain(|(_, g), _| g != guild_id);
        for ((g, _), network) in state.networks.iter_mut() {
            if g == guild_id {
                network.clear();
            }
        }
        Ok(removed)
    }

    async fn health(&self) -> Result<String> {
        self.check()?;
        Ok("memory".to_string())
    }
}
