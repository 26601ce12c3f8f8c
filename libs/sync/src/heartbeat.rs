//! Throttled status broadcasts for the local tracker.
//!
//! At most one `tracker_update` leaves per throttle window. A status change
//! inside the window replaces any earlier pending one and is flushed as soon
//! as the window opens.

use pitchside_common::protocol::{HeartbeatMetrics, TrackerStatus, TrackerStatusUpdate, UpdateKind};

pub struct StatusBroadcaster {
    tracker_id: String,
    throttle_ms: i64,
    status: TrackerStatus,
    action: Option<String>,
    metrics: HeartbeatMetrics,
    last_sent_at_ms: Option<i64>,
    pending: bool,
}

impl StatusBroadcaster {
    pub fn new(tracker_id: impl Into<String>, throttle_ms: i64) -> Self {
        Self {
            tracker_id: tracker_id.into(),
            throttle_ms,
            status: TrackerStatus::Active,
            action: None,
            metrics: HeartbeatMetrics::default(),
            last_sent_at_ms: None,
            pending: false,
        }
    }

    pub fn status(&self) -> TrackerStatus {
        self.status
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// Change the local status. Returns the update to send now, or `None`
    /// when the window is closed (the change is kept as pending).
    pub fn update(
        &mut self,
        status: TrackerStatus,
        action: Option<String>,
        now_ms: i64,
    ) -> Option<TrackerStatusUpdate> {
        self.status = status;
        self.action = action;
        if self.window_open(now_ms) {
            return Some(self.emit(now_ms));
        }
        self.pending = true;
        None
    }

    /// Metrics ride along with the next update; they never force one.
    pub fn set_metrics(&mut self, metrics: HeartbeatMetrics) {
        self.metrics = metrics;
    }

    /// Periodic heartbeat. Emits the current status when the window is open.
    pub fn tick(&mut self, now_ms: i64) -> Option<TrackerStatusUpdate> {
        if self.window_open(now_ms) {
            Some(self.emit(now_ms))
        } else {
            None
        }
    }

    /// Milliseconds until a pending change can be flushed.
    pub fn pending_due_in(&self, now_ms: i64) -> Option<i64> {
        if !self.pending {
            return None;
        }
        let opens_at = self.last_sent_at_ms.map_or(now_ms, |sent| sent + self.throttle_ms);
        Some((opens_at - now_ms).max(0))
    }

    /// Emit regardless of the window. Used for departure.
    pub fn force(&mut self, status: TrackerStatus, now_ms: i64) -> TrackerStatusUpdate {
        self.status = status;
        self.emit(now_ms)
    }

    fn window_open(&self, now_ms: i64) -> bool {
        self.last_sent_at_ms
            .map_or(true, |sent| now_ms - sent >= self.throttle_ms)
    }

    fn emit(&mut self, now_ms: i64) -> TrackerStatusUpdate {
        self.last_sent_at_ms = Some(now_ms);
        self.pending = false;
        TrackerStatusUpdate {
            kind: UpdateKind::TrackerStatus,
            tracker_id: self.tracker_id.clone(),
            status: self.status,
            action: self.action.clone(),
            timestamp: now_ms,
            metrics: self.metrics,
        }
    }
}
