//! Engine notifications for the UI layer.
//!
//! One `tokio::sync::broadcast` channel per match session. UIs subscribe and
//! re-read whatever view the notification concerns.

use pitchside_common::protocol::{Assignment, TrackedEvent};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::absence::AbsenceRecord;
use crate::presence::TrackerPresenceRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
}

/// Who a notice is meant for. Clients show only notices addressed to them or
/// to everyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Everyone,
    Tracker(String),
    Coordinators,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub recipient: Recipient,
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    EventAdded { event: TrackedEvent },
    EventConfirmed { event: TrackedEvent },
    EventFailed { event: TrackedEvent, reason: String },
    TrackerJoined { tracker_id: String },
    TrackerLeft { tracker_id: String },
    PresenceChanged { record: TrackerPresenceRecord },
    AbsenceDetected { absence: AbsenceRecord },
    AbsenceCleared { tracker_id: String },
    Reassigned {
        absent_tracker_id: String,
        replacement_tracker_id: String,
        assignments: Vec<Assignment>,
    },
    NoReplacementAvailable { absent_tracker_id: String },
    /// This client was handed assignments by a reassignment.
    AssignmentReceived { assignments: Vec<Assignment> },
    ConnectionChanged { connected: bool },
    Notice(Notice),
}

/// Cloneable handle over the session's notification channel.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<EngineEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is fine: nobody is watching the UI.
        let _ = self.sender.send(event);
    }

    pub fn notice(&self, recipient: Recipient, level: NoticeLevel, message: impl Into<String>) {
        self.emit(EngineEvent::Notice(Notice {
            recipient,
            level,
            message: message.into(),
        }));
    }
}
