//! Absence detection: flags stale or repeatedly silent trackers exactly once
//! per absence, and clears them when they come back.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use crate::presence::PresenceTracker;

/// Why a tracker was flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbsenceReason {
    Inactivity { minutes: i64 },
    MissedHeartbeats { count: u32 },
    /// The tracker's channel subscription ended.
    Departed,
}

impl fmt::Display for AbsenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbsenceReason::Inactivity { minutes: 1 } => f.write_str("No activity for 1 minute"),
            AbsenceReason::Inactivity { minutes } => {
                write!(f, "No activity for {minutes} minutes")
            }
            AbsenceReason::MissedHeartbeats { count } => {
                write!(f, "Missed {count} consecutive heartbeats")
            }
            AbsenceReason::Departed => f.write_str("Left the match"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbsenceRecord {
    pub tracker_id: String,
    pub detected_at_ms: i64,
    pub reason: AbsenceReason,
    /// Handled: either replaced or back online.
    pub resolved: bool,
    pub replaced_by: Option<String>,
    /// "No replacement available" was already announced for this absence.
    pub no_replacement_notified: bool,
    /// The operator dismissed the standing warning.
    pub dismissed: bool,
}

pub struct AbsenceDetector {
    inactivity_threshold_ms: i64,
    max_missed: u32,
    active: BTreeMap<String, AbsenceRecord>,
    last_scan_at_ms: Option<i64>,
}

impl AbsenceDetector {
    pub fn new(inactivity_threshold_ms: i64, max_missed: u32) -> Self {
        Self {
            inactivity_threshold_ms,
            max_missed,
            active: BTreeMap::new(),
            last_scan_at_ms: None,
        }
    }

    /// Flag every tracker that is stale or has too many misses and is not
    /// already flagged. Returns only the new absences.
    ///
    /// Trackers silent since the previous scan get one more miss first.
    pub fn scan(&mut self, now_ms: i64, presence: &mut PresenceTracker) -> Vec<AbsenceRecord> {
        if let Some(previous) = self.last_scan_at_ms {
            presence.mark_silent_since(previous);
        }
        self.last_scan_at_ms = Some(now_ms);

        let mut detected = Vec::new();
        for record in presence.records() {
            let idle_ms = now_ms - record.last_activity_at_ms;
            let stale = idle_ms > self.inactivity_threshold_ms;
            let missed = record.consecutive_missed_heartbeats >= self.max_missed;
            if !stale && !missed {
                continue;
            }
            if self.active.contains_key(&record.tracker_id) {
                tracing::trace!(tracker_id = %record.tracker_id, "already flagged absent");
                continue;
            }

            let reason = if stale {
                AbsenceReason::Inactivity {
                    // Sub-minute thresholds still read as one minute.
                    minutes: ((idle_ms as f64 / 60_000.0).round() as i64).max(1),
                }
            } else {
                AbsenceReason::MissedHeartbeats {
                    count: record.consecutive_missed_heartbeats,
                }
            };
            tracing::warn!(tracker_id = %record.tracker_id, %reason, "tracker absence detected");
            detected.push(self.flag(&record.tracker_id, reason, now_ms));
        }
        detected
    }

    /// Flag a tracker whose subscription ended, without waiting for the
    /// timeout. `None` when it is already flagged.
    pub fn flag_departed(&mut self, tracker_id: &str, now_ms: i64) -> Option<AbsenceRecord> {
        if self.active.contains_key(tracker_id) {
            return None;
        }
        tracing::info!(%tracker_id, "tracker departed");
        Some(self.flag(tracker_id, AbsenceReason::Departed, now_ms))
    }

    fn flag(&mut self, tracker_id: &str, reason: AbsenceReason, now_ms: i64) -> AbsenceRecord {
        let record = AbsenceRecord {
            tracker_id: tracker_id.to_string(),
            detected_at_ms: now_ms,
            reason,
            resolved: false,
            replaced_by: None,
            no_replacement_notified: false,
            dismissed: false,
        };
        self.active.insert(tracker_id.to_string(), record.clone());
        record
    }

    /// The tracker is back. Returns the closed record, or `None` when it was
    /// not flagged.
    pub fn clear(&mut self, tracker_id: &str) -> Option<AbsenceRecord> {
        let mut record = self.active.remove(tracker_id)?;
        record.resolved = true;
        tracing::info!(%tracker_id, "tracker absence cleared");
        Some(record)
    }

    pub fn get(&self, tracker_id: &str) -> Option<&AbsenceRecord> {
        self.active.get(tracker_id)
    }

    pub fn active_absences(&self) -> Vec<AbsenceRecord> {
        self.active.values().cloned().collect()
    }

    pub fn absent_ids(&self) -> HashSet<String> {
        self.active.keys().cloned().collect()
    }

    /// Absences nobody has taken over yet.
    pub fn unresolved(&self) -> Vec<String> {
        self.active
            .values()
            .filter(|r| !r.resolved)
            .map(|r| r.tracker_id.clone())
            .collect()
    }

    /// Standing "no replacement available" warnings.
    pub fn warnings(&self) -> Vec<AbsenceRecord> {
        self.active
            .values()
            .filter(|r| !r.resolved && r.no_replacement_notified && !r.dismissed)
            .cloned()
            .collect()
    }

    pub fn dismiss_warning(&mut self, tracker_id: &str) -> bool {
        match self.active.get_mut(tracker_id) {
            Some(record) if !record.dismissed => {
                record.dismissed = true;
                true
            }
            _ => false,
        }
    }

    pub fn mark_replaced(&mut self, tracker_id: &str, replacement: &str) {
        if let Some(record) = self.active.get_mut(tracker_id) {
            record.resolved = true;
            record.replaced_by = Some(replacement.to_string());
        }
    }

    /// Nothing left to hand over (someone already moved the work).
    pub fn mark_resolved(&mut self, tracker_id: &str) {
        if let Some(record) = self.active.get_mut(tracker_id) {
            record.resolved = true;
        }
    }

    /// Returns `true` the first time it is called for the current absence.
    pub fn note_no_replacement(&mut self, tracker_id: &str) -> bool {
        match self.active.get_mut(tracker_id) {
            Some(record) if !record.no_replacement_notified => {
                record.no_replacement_notified = true;
                true
            }
            _ => false,
        }
    }
}

/// The view of absence state the replacement assigner reads and updates.
/// Each call is short and synchronous so implementors can lock per call.
pub trait AbsenceBook: Send + Sync {
    fn absence(&self, tracker_id: &str) -> Option<AbsenceRecord>;
    fn absent_trackers(&self) -> HashSet<String>;
    fn mark_replaced(&self, tracker_id: &str, replacement: &str);
    fn mark_resolved(&self, tracker_id: &str);
    fn note_no_replacement(&self, tracker_id: &str) -> bool;
}

impl AbsenceBook for Mutex<AbsenceDetector> {
    fn absence(&self, tracker_id: &str) -> Option<AbsenceRecord> {
        self.lock().get(tracker_id).cloned()
    }

    fn absent_trackers(&self) -> HashSet<String> {
        self.lock().absent_ids()
    }

    fn mark_replaced(&self, tracker_id: &str, replacement: &str) {
        self.lock().mark_replaced(tracker_id, replacement);
    }

    fn mark_resolved(&self, tracker_id: &str) {
        self.lock().mark_resolved(tracker_id);
    }

    fn note_no_replacement(&self, tracker_id: &str) -> bool {
        self.lock().note_no_replacement(tracker_id)
    }
}
