//! In-memory per-tracker presence with multi-socket support.
//!
//! Presence is per **tracker per match**, not per socket. A tracker is only
//! announced as left when it untracks explicitly, or when all of its sockets
//! have been gone for longer than the grace period.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use pitchside_common::protocol::PresenceEntry;
use serde_json::Value;

struct TrackerPresence {
    /// Opaque blob the client tracked.
    state: Value,
    /// Sockets that currently track this presence.
    socket_count: usize,
    /// Set when `socket_count` drops to 0; cleared when a socket tracks again.
    disconnected_at: Option<Instant>,
}

/// A tracker whose grace period expired; the caller broadcasts the leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredPresence {
    pub match_id: String,
    pub tracker_id: String,
}

type Key = (String, String);

/// Thread-safe, DashMap-backed presence registry keyed by (match, tracker).
pub struct PresenceRegistry {
    inner: DashMap<Key, TrackerPresence>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    fn key(match_id: &str, tracker_id: &str) -> Key {
        (match_id.to_string(), tracker_id.to_string())
    }

    /// Store the tracked state. `first_for_socket` is true the first time a
    /// given socket tracks, which counts it towards the tracker's sockets.
    pub fn track(&self, match_id: &str, tracker_id: &str, state: Value, first_for_socket: bool) {
        let mut entry = self
            .inner
            .entry(Self::key(match_id, tracker_id))
            .or_insert_with(|| TrackerPresence {
                state: Value::Null,
                socket_count: 0,
                disconnected_at: None,
            });
        entry.state = state;
        if first_for_socket {
            entry.socket_count += 1;
        }
        entry.disconnected_at = None;
    }

    /// A socket stopped tracking on purpose. Returns `true` when that was the
    /// tracker's last socket and it is now gone.
    pub fn untrack(&self, match_id: &str, tracker_id: &str) -> bool {
        let key = Self::key(match_id, tracker_id);
        let gone = match self.inner.get_mut(&key) {
            Some(mut entry) => {
                entry.socket_count = entry.socket_count.saturating_sub(1);
                entry.socket_count == 0
            }
            None => return false,
        };
        if gone {
            self.inner.remove(&key);
        }
        gone
    }

    /// A tracking socket went away without untracking. If it was the last
    /// one, the sweeper handles the grace period. No broadcast here.
    pub fn disconnect(&self, match_id: &str, tracker_id: &str) {
        if let Some(mut entry) = self.inner.get_mut(&Self::key(match_id, tracker_id)) {
            entry.socket_count = entry.socket_count.saturating_sub(1);
            if entry.socket_count == 0 {
                entry.disconnected_at = Some(Instant::now());
            }
        }
    }

    /// Remove trackers whose grace period has expired and return them so the
    /// caller can broadcast `presence_leave`.
    pub fn sweep(&self, grace_period: Duration) -> Vec<ExpiredPresence> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.inner.retain(|(match_id, tracker_id), presence| {
            let stale = presence.socket_count == 0
                && presence
                    .disconnected_at
                    .is_some_and(|at| now.duration_since(at) >= grace_period);
            if stale {
                expired.push(ExpiredPresence {
                    match_id: match_id.clone(),
                    tracker_id: tracker_id.clone(),
                });
            }
            !stale
        });
        expired.sort_by(|a, b| (&a.match_id, &a.tracker_id).cmp(&(&b.match_id, &b.tracker_id)));
        expired
    }

    /// Everyone currently present in a match, including trackers inside
    /// their grace period.
    pub fn list(&self, match_id: &str) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .inner
            .iter()
            .filter(|entry| entry.key().0 == match_id)
            .map(|entry| PresenceEntry {
                tracker_id: entry.key().1.clone(),
                state: entry.value().state.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.tracker_id.cmp(&b.tracker_id));
        entries
    }

    /// Present trackers per match.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.inner.iter() {
            *counts.entry(entry.key().0.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
