//! Per-match tracker liveness table.
//!
//! The tracker records what it is told and performs no timing of its own;
//! the absence detector decides what "stale" means.

use std::collections::BTreeMap;

use pitchside_common::protocol::{EventType, HeartbeatMetrics, NetworkQuality, TrackerStatus};
use serde::Serialize;

/// Last-known state of one tracker in one match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerPresenceRecord {
    pub tracker_id: String,
    pub status: TrackerStatus,
    pub last_activity_at_ms: i64,
    pub current_action: Option<String>,
    pub consecutive_missed_heartbeats: u32,
    pub battery_level: Option<u8>,
    pub network_quality: Option<NetworkQuality>,
}

impl TrackerPresenceRecord {
    fn new(tracker_id: &str, status: TrackerStatus, at_ms: i64) -> Self {
        Self {
            tracker_id: tracker_id.to_string(),
            status,
            last_activity_at_ms: at_ms,
            current_action: None,
            consecutive_missed_heartbeats: 0,
            battery_level: None,
            network_quality: None,
        }
    }
}

pub struct PresenceTracker {
    records: BTreeMap<String, TrackerPresenceRecord>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    /// Upsert from a heartbeat. Live statuses reset the miss counter; an
    /// explicit `inactive` counts as one miss.
    ///
    /// Returns `true` when this is the first record for the tracker.
    pub fn ingest_heartbeat(
        &mut self,
        tracker_id: &str,
        status: TrackerStatus,
        metrics: HeartbeatMetrics,
        at_ms: i64,
    ) -> bool {
        let is_new = !self.records.contains_key(tracker_id);
        let record = self
            .records
            .entry(tracker_id.to_string())
            .or_insert_with(|| TrackerPresenceRecord::new(tracker_id, status, at_ms));

        record.status = status;
        // Duplicate or reordered deliveries must not move the clock backwards.
        record.last_activity_at_ms = record.last_activity_at_ms.max(at_ms);
        if status.is_live() {
            record.consecutive_missed_heartbeats = 0;
        } else {
            record.consecutive_missed_heartbeats += 1;
        }
        if metrics.battery_level.is_some() {
            record.battery_level = metrics.battery_level;
        }
        if metrics.network_quality.is_some() {
            record.network_quality = metrics.network_quality;
        }

        is_new
    }

    /// Record that a tracker just captured an event. Counts as liveness for
    /// staleness purposes but leaves the miss counter alone.
    ///
    /// Returns `true` when this is the first record for the tracker.
    pub fn ingest_activity_broadcast(
        &mut self,
        tracker_id: &str,
        event_type: EventType,
        at_ms: i64,
    ) -> bool {
        let is_new = !self.records.contains_key(tracker_id);
        let record = self
            .records
            .entry(tracker_id.to_string())
            .or_insert_with(|| TrackerPresenceRecord::new(tracker_id, TrackerStatus::Recording, at_ms));

        record.current_action = Some(event_type.to_string());
        record.last_activity_at_ms = record.last_activity_at_ms.max(at_ms);

        is_new
    }

    /// What the tracker says it is doing, as carried by its status update.
    pub fn set_action(&mut self, tracker_id: &str, action: Option<String>) {
        if let Some(record) = self.records.get_mut(tracker_id) {
            record.current_action = action;
        }
    }

    /// Count a miss for every tracker silent since `cutoff_ms` (the previous
    /// scan). Returns the trackers that were bumped.
    pub fn mark_silent_since(&mut self, cutoff_ms: i64) -> Vec<String> {
        let mut bumped = Vec::new();
        for record in self.records.values_mut() {
            if record.last_activity_at_ms <= cutoff_ms {
                record.consecutive_missed_heartbeats += 1;
                bumped.push(record.tracker_id.clone());
            }
        }
        bumped
    }

    /// Ordered (by tracker id) read-only view.
    pub fn snapshot(&self) -> Vec<TrackerPresenceRecord> {
        self.records.values().cloned().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &TrackerPresenceRecord> {
        self.records.values()
    }

    pub fn get(&self, tracker_id: &str) -> Option<&TrackerPresenceRecord> {
        self.records.get(tracker_id)
    }

    /// Drop a tracker that left the match.
    pub fn remove(&mut self, tracker_id: &str) -> Option<TrackerPresenceRecord> {
        self.records.remove(tracker_id)
    }

    /// Match over: forget everyone.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
