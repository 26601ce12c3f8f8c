//! Optimistic event list, outbound queue, and reconciliation against
//! channel echoes and confirmations.
//!
//! This is a pure state machine. The session runtime owns the only instance
//! for a match and drives it from the inbound pump and the outbound drain.

use std::collections::{HashMap, HashSet, VecDeque};

use pitchside_common::id::{prefix, prefixed_ulid};
use pitchside_common::protocol::{
    ChannelMessage, Coordinates, EventStatus, EventType, TeamSide, TrackedEvent,
};

use crate::error::{Result, SyncError};

/// What the UI hands over when an operator presses a button.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub team_id: TeamSide,
    pub player_id: Option<u32>,
    pub coordinates: Option<Coordinates>,
    /// Match time; derived from the kickoff clock when absent.
    pub timestamp_ms: Option<i64>,
}

impl EventDraft {
    pub fn new(event_type: EventType, team_id: TeamSide) -> Self {
        Self {
            event_type,
            team_id,
            player_id: None,
            coordinates: None,
            timestamp_ms: None,
        }
    }

    pub fn player(mut self, player_id: u32) -> Self {
        self.player_id = Some(player_id);
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.coordinates = Some(Coordinates { x, y });
        self
    }

    pub fn match_time(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }
}

/// A visible change to the merged event list.
#[derive(Debug, Clone, PartialEq)]
pub enum EventChange {
    /// A peer's event entered the view.
    Added(TrackedEvent),
    /// One of our own events was confirmed.
    Confirmed(TrackedEvent),
    Failed { event: TrackedEvent, reason: String },
}

pub struct EventSyncEngine {
    match_id: String,
    tracker_id: String,
    kickoff_at_ms: i64,
    /// Events this client originated, in creation order.
    optimistic: Vec<TrackedEvent>,
    /// Events learned from the channel.
    confirmed: Vec<TrackedEvent>,
    confirmed_ids: HashSet<String>,
    /// Ids waiting for a transport acknowledgement, oldest first.
    outbound: VecDeque<String>,
}

impl EventSyncEngine {
    pub fn new(match_id: impl Into<String>, tracker_id: impl Into<String>, kickoff_at_ms: i64) -> Self {
        Self {
            match_id: match_id.into(),
            tracker_id: tracker_id.into(),
            kickoff_at_ms,
            optimistic: Vec::new(),
            confirmed: Vec::new(),
            confirmed_ids: HashSet::new(),
            outbound: VecDeque::new(),
        }
    }

    pub fn set_kickoff(&mut self, kickoff_at_ms: i64) {
        self.kickoff_at_ms = kickoff_at_ms;
    }

    /// Create an event with a fresh id, show it immediately, and queue it.
    pub fn record_event(&mut self, draft: EventDraft, now_ms: i64) -> TrackedEvent {
        let mut event = TrackedEvent {
            id: prefixed_ulid(prefix::EVENT),
            match_id: self.match_id.clone(),
            event_type: draft.event_type,
            team_id: draft.team_id,
            player_id: draft.player_id,
            timestamp_ms: draft
                .timestamp_ms
                .unwrap_or_else(|| (now_ms - self.kickoff_at_ms).max(0)),
            coordinates: draft.coordinates,
            created_by: self.tracker_id.clone(),
            status: EventStatus::Optimistic,
        };
        self.optimistic.push(event.clone());

        self.enqueue(&event.id);
        event.status = EventStatus::PendingConfirmation;
        event
    }

    fn enqueue(&mut self, id: &str) {
        if let Some(local) = self.optimistic.iter_mut().find(|e| e.id == id) {
            local.status = EventStatus::PendingConfirmation;
            if !self.outbound.iter().any(|queued| queued == id) {
                self.outbound.push_back(id.to_string());
            }
        }
    }

    /// Apply an inbound channel message. Topics other than `add_event` and
    /// `event_confirmed` are ignored.
    pub fn on_channel_message(&mut self, msg: &ChannelMessage) -> Option<EventChange> {
        match msg {
            ChannelMessage::AddEvent(event) => self.apply_add(event),
            ChannelMessage::EventConfirmed(event) => self.apply_confirmation(event),
            _ => None,
        }
    }

    fn apply_add(&mut self, event: &TrackedEvent) -> Option<EventChange> {
        if event.match_id != self.match_id {
            tracing::debug!(event_id = %event.id, match_id = %event.match_id, "ignoring event for another match");
            return None;
        }
        if self.is_local(&event.id) || self.confirmed_ids.contains(&event.id) {
            return None;
        }
        let mut stored = event.clone();
        stored.status = EventStatus::Confirmed;
        self.confirmed_ids.insert(stored.id.clone());
        self.confirmed.push(stored.clone());
        Some(EventChange::Added(stored))
    }

    fn apply_confirmation(&mut self, event: &TrackedEvent) -> Option<EventChange> {
        if event.match_id != self.match_id {
            return None;
        }

        if let Some(local) = self.optimistic.iter_mut().find(|e| e.id == event.id) {
            if local.status == EventStatus::Confirmed {
                return None;
            }
            local.status = EventStatus::Confirmed;
            let confirmed = local.clone();
            self.outbound.retain(|queued| queued != &event.id);
            return Some(EventChange::Confirmed(confirmed));
        }

        if self.confirmed_ids.contains(&event.id) {
            return None;
        }

        // Confirmation overtook the peer's add_event.
        self.apply_add(event)
    }

    /// Oldest queued event, without removing it.
    pub fn next_outbound(&self) -> Option<TrackedEvent> {
        let id = self.outbound.front()?;
        self.get_local(id).cloned()
    }

    /// Queued events in send order.
    pub fn outbound(&self) -> Vec<TrackedEvent> {
        self.outbound
            .iter()
            .filter_map(|id| self.get_local(id).cloned())
            .collect()
    }

    /// The transport acknowledged the send; the event leaves the queue but
    /// keeps waiting for its business-level confirmation.
    pub fn mark_sent(&mut self, id: &str) {
        self.outbound.retain(|queued| queued != id);
    }

    /// The transport refused the send. The event stays visible, flagged.
    pub fn mark_failed(&mut self, id: &str, reason: impl Into<String>) -> Option<EventChange> {
        self.outbound.retain(|queued| queued != id);
        let local = self.optimistic.iter_mut().find(|e| e.id == id)?;
        if local.status == EventStatus::Confirmed {
            return None;
        }
        local.status = EventStatus::Failed;
        Some(EventChange::Failed {
            event: local.clone(),
            reason: reason.into(),
        })
    }

    /// Put a failed event back on the queue under its original id.
    pub fn retry(&mut self, id: &str) -> Result<TrackedEvent> {
        let status = self
            .get_local(id)
            .map(|e| e.status)
            .ok_or_else(|| SyncError::UnknownEvent(id.to_string()))?;
        if status != EventStatus::Failed {
            return Err(SyncError::NotRetryable(id.to_string()));
        }
        self.enqueue(id);
        self.get_local(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownEvent(id.to_string()))
    }

    pub fn retry_failed(&mut self) -> Vec<TrackedEvent> {
        let failed: Vec<String> = self
            .optimistic
            .iter()
            .filter(|e| e.status == EventStatus::Failed)
            .map(|e| e.id.clone())
            .collect();
        failed.iter().filter_map(|id| self.retry(id).ok()).collect()
    }

    /// Merged view: one entry per id, in match-time order.
    pub fn events(&self) -> Vec<TrackedEvent> {
        let mut merged: HashMap<&str, &TrackedEvent> = HashMap::new();
        for event in self.optimistic.iter().chain(self.confirmed.iter()) {
            merged
                .entry(event.id.as_str())
                .and_modify(|current| {
                    if status_rank(event.status) > status_rank(current.status) {
                        *current = event;
                    }
                })
                .or_insert(event);
        }
        let mut view: Vec<TrackedEvent> = merged.into_values().cloned().collect();
        view.sort_by(|a, b| a.timestamp_ms.cmp(&b.timestamp_ms).then_with(|| a.id.cmp(&b.id)));
        view
    }

    pub fn get(&self, id: &str) -> Option<TrackedEvent> {
        self.get_local(id)
            .or_else(|| self.confirmed.iter().find(|e| e.id == id))
            .cloned()
    }

    pub fn failed(&self) -> Vec<TrackedEvent> {
        self.optimistic
            .iter()
            .filter(|e| e.status == EventStatus::Failed)
            .cloned()
            .collect()
    }

    fn get_local(&self, id: &str) -> Option<&TrackedEvent> {
        self.optimistic.iter().find(|e| e.id == id)
    }

    fn is_local(&self, id: &str) -> bool {
        self.get_local(id).is_some()
    }
}

fn status_rank(status: EventStatus) -> u8 {
    match status {
        EventStatus::Failed => 0,
        EventStatus::Optimistic => 1,
        EventStatus::PendingConfirmation => 2,
        EventStatus::Confirmed => 3,
    }
}
