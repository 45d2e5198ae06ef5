//! Per-channel recent-message window
//!
//! Bounded ring buffer of the last N messages per (guild, channel), used by the
//! recorder to find proximity partners for a new message. The window is pure
//! in-process state: losing it on restart only means the first few messages
//! after boot find no partners.
//!
//! Locking: the outer map lock is held only long enough to fetch the channel
//! slot; the channel lock only for the synchronous snapshot + push. Neither is
//! ever held across a store call. The map lock is always taken before a
//! channel lock.
//!
//! Channels that went quiet are dropped every `SWEEP_EVERY` observations, so
//! the map tracks active channels rather than every channel ever seen.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use rapport_core::config::RecorderConfig;

type ChannelKey = (String, String);

const SWEEP_EVERY: usize = 256;

/// One message remembered by the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentMessage {
    pub message_id: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ProximityWindow {
    capacity: usize,
    proximity: Duration,
    cutoff: Duration,
    channels: Mutex<HashMap<ChannelKey, Arc<Mutex<VecDeque<RecentMessage>>>>>,
    observed: AtomicUsize,
}

// ============================================================================
// PUBLIC API
// ============================================================================

impl ProximityWindow {
    pub fn new(config: &RecorderConfig) -> Self {
        Self {
            capacity: config.window_size.max(1),
            proximity: Duration::minutes(config.proximity_minutes),
            cutoff: Duration::minutes(config.window_cutoff_minutes.max(config.proximity_minutes)),
            channels: Mutex::new(HashMap::new()),
            observed: AtomicUsize::new(0),
        }
    }

    /// Record `message` in its channel window and return its proximity partners:
    /// the most recent message of each other author within the proximity
    /// threshold, newest first.
    pub fn observe(&self, guild_id: &str, channel_id: &str, message: RecentMessage) -> Vec<RecentMessage> {
        let at = message.created_at;
        let partners = self.observe_in_channel(guild_id, channel_id, message);

        if self.observed.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.evict_idle(at);
        }
        partners
    }

    /// Drop channel windows whose newest entry is older than the cutoff
    /// relative to `now`. Slots currently held by an observer are skipped.
    /// Returns how many channels were dropped.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let horizon = now - self.cutoff;
        let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let window = slot.lock().unwrap_or_else(|e| e.into_inner());
            window.iter().any(|m| m.created_at >= horizon)
        });
        let dropped = before - map.len();
        if dropped > 0 {
            tracing::debug!("Evicted {} idle proximity windows", dropped);
        }
        dropped
    }

    /// Number of channel windows currently held.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Messages currently held for a channel.
    pub fn len(&self, guild_id: &str, channel_id: &str) -> usize {
        let map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&(guild_id.to_string(), channel_id.to_string()))
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    /// Drop every channel window for a guild.
    pub fn forget_guild(&self, guild_id: &str) {
        let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|(guild, _), _| guild != guild_id);
    }
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

impl ProximityWindow {
    fn observe_in_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
        message: RecentMessage,
    ) -> Vec<RecentMessage> {
        let slot = self.slot(guild_id, channel_id);
        let mut window = slot.lock().unwrap_or_else(|e| e.into_inner());

        // Evict against the newest time seen so late backfill never flushes live entries
        let newest = window
            .iter()
            .map(|m| m.created_at)
            .chain(std::iter::once(message.created_at))
            .max()
            .unwrap_or(message.created_at);
        let horizon = newest - self.cutoff;
        window.retain(|m| m.created_at >= horizon);

        let partners = partners_for(&window, &message, self.proximity);

        if !window.iter().any(|m| m.message_id == message.message_id) {
            window.push_back(message);
            while window.len() > self.capacity {
                window.pop_front();
            }
        }

        partners
    }

    fn slot(&self, guild_id: &str, channel_id: &str) -> Arc<Mutex<VecDeque<RecentMessage>>> {
        let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        map.entry((guild_id.to_string(), channel_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(self.capacity))))
            .clone()
    }
}

fn partners_for(
    window: &VecDeque<RecentMessage>,
    message: &RecentMessage,
    proximity: Duration,
) -> Vec<RecentMessage> {
    let mut partners: Vec<RecentMessage> = Vec::new();
    for entry in window.iter().rev() {
        if entry.author_id == message.author_id || entry.message_id == message.message_id {
            continue;
        }
        if (message.created_at - entry.created_at).abs() > proximity {
            continue;
        }
        match partners.iter_mut().find(|p| p.author_id == entry.author_id) {
            Some(existing) if entry.created_at > existing.created_at => *existing = entry.clone(),
            Some(_) => {}
            None => partners.push(entry.clone()),
        }
    }
    partners.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    partners
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, author: &str, at: DateTime<Utc>) -> RecentMessage {
        RecentMessage {
            message_id: id.to_string(),
            author_id: author.to_string(),
            created_at: at,
        }
    }

    fn window() -> ProximityWindow {
        ProximityWindow::new(&RecorderConfig::default())
    }

    // ========================================================================
    // TEST 1: first message in a channel has no partners
    // ========================================================================
    #[test]
    fn test_first_message_no_partners() {
        let w = window();
        let partners = w.observe("g", "c", msg("1", "a", Utc::now()));
        assert!(partners.is_empty());
        assert_eq!(w.len("g", "c"), 1);
    }

    // ========================================================================
    // TEST 2: one partner per distinct author, most recent message wins
    // ========================================================================
    #[test]
    fn test_one_partner_per_author() {
        let w = window();
        let t0 = Utc::now();
        w.observe("g", "c", msg("1", "b", t0));
        w.observe("g", "c", msg("2", "b", t0 + Duration::minutes(1)));
        w.observe("g", "c", msg("3", "c", t0 + Duration::minutes(2)));

        let partners = w.observe("g", "c", msg("4", "a", t0 + Duration::minutes(3)));
        assert_eq!(partners.len(), 2);
        assert_eq!(partners[0].author_id, "c");
        assert_eq!(partners[1].message_id, "2", "latest message from b is used");
    }

    // ========================================================================
    // TEST 3: messages outside the proximity threshold are not partners
    // ========================================================================
    #[test]
    fn test_proximity_threshold() {
        let w = window();
        let t0 = Utc::now();
        w.observe("g", "c", msg("1", "b", t0));
        let partners = w.observe("g", "c", msg("2", "a", t0 + Duration::minutes(6)));
        assert!(partners.is_empty());
    }

    // ========================================================================
    // TEST 4: capacity and channel isolation
    // ========================================================================
    #[test]
    fn test_capacity_and_isolation() {
        let w = window();
        let t0 = Utc::now();
        for i in 0..15 {
            w.observe("g", "c", msg(&i.to_string(), &format!("u{}", i), t0));
        }
        assert_eq!(w.len("g", "c"), 10);
        assert_eq!(w.len("g", "other"), 0);

        let partners = w.observe("g", "other", msg("x", "a", t0));
        assert!(partners.is_empty(), "windows are never shared across channels");
    }

    // ========================================================================
    // TEST 5: stale entries are evicted by the cutoff
    // ========================================================================
    #[test]
    fn test_cutoff_eviction() {
        let w = window();
        let t0 = Utc::now();
        w.observe("g", "c", msg("1", "b", t0));
        w.observe("g", "c", msg("2", "a", t0 + Duration::minutes(20)));
        assert_eq!(w.len("g", "c"), 1);
    }

    // ========================================================================
    // TEST 6: replayed message is not added twice
    // ========================================================================
    #[test]
    fn test_replay_not_duplicated() {
        let w = window();
        let t0 = Utc::now();
        w.observe("g", "c", msg("1", "b", t0));
        w.observe("g", "c", msg("1", "b", t0));
        assert_eq!(w.len("g", "c"), 1);

        w.forget_guild("g");
        assert_eq!(w.len("g", "c"), 0);
    }

    // ========================================================================
    // TEST 7: quiet channels are dropped from the map
    // ========================================================================
    #[test]
    fn test_idle_channels_evicted() {
        let w = window();
        let t0 = Utc::now();
        w.observe("g", "quiet", msg("1", "a", t0));
        w.observe("g", "busy", msg("2", "b", t0 + Duration::minutes(30)));
        assert_eq!(w.channel_count(), 2);

        assert_eq!(w.evict_idle(t0 + Duration::minutes(30)), 1);
        assert_eq!(w.channel_count(), 1);
        assert_eq!(w.len("g", "quiet"), 0);
        assert_eq!(w.len("g", "busy"), 1);
    }

    // ========================================================================
    // TEST 8: observing many one-off channels keeps the map bounded
    // ========================================================================
    #[test]
    fn test_sweep_bounds_channel_map() {
        let w = window();
        let t0 = Utc::now();
        for i in 0..(SWEEP_EVERY * 4) {
            let at = t0 + Duration::minutes(i as i64);
            w.observe("g", &format!("c{}", i), msg(&i.to_string(), "a", at));
        }
        assert!(w.channel_count() <= SWEEP_EVERY);
    }
}
