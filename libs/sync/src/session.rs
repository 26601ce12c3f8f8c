//! Per-match engine runtime.
//!
//! One [`MatchSession`] per match, built explicitly and torn down with
//! [`MatchSession::shutdown`]. All engine state sits behind a single mutex that
//! is never held across an await; four tasks drive it:
//!
//! - inbound pump: applies channel messages and presence changes
//! - outbound drain: publishes queued events while connected
//! - heartbeat: throttled `tracker_update` broadcasts
//! - absence scan: coordinator only

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use pitchside_common::clock::now_ms;
use pitchside_common::protocol::{
    Assignment, ChannelMessage, EventTracked, EventType, HeartbeatMetrics, PresenceState,
    TrackedEvent, TrackerReassigned, TrackerStatus, TrackerStatusUpdate,
};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::absence::{AbsenceBook, AbsenceDetector, AbsenceRecord};
use crate::assignment::{AssignmentStore, ReassignOutcome, ReplacementAssigner};
use crate::channel::{BroadcastChannel, ChannelInbound, PresenceMember, Subscription};
use crate::config::{ClientRole, EngineConfig};
use crate::error::{Result, SyncError};
use crate::events::{EventChange, EventDraft, EventSyncEngine};
use crate::heartbeat::StatusBroadcaster;
use crate::notify::{EngineEvent, NoticeLevel, Notifier, Recipient};
use crate::persist::Persistence;
use crate::presence::{PresenceTracker, TrackerPresenceRecord};

struct EngineState {
    events: EventSyncEngine,
    presence: PresenceTracker,
    detector: AbsenceDetector,
    status: StatusBroadcaster,
    /// Status update produced outside the heartbeat task, waiting to be sent.
    outbox: Option<TrackerStatusUpdate>,
    last_event_type: Option<EventType>,
    last_tracked: Option<PresenceState>,
    /// Peers currently in the channel's presence set.
    members: BTreeSet<String>,
    /// What this client is responsible for.
    assignments: Vec<Assignment>,
}

impl EngineState {
    fn presence_state(&self, tracker_id: &str, online_at: i64) -> PresenceState {
        PresenceState {
            tracker_id: tracker_id.to_string(),
            status: self.status.status(),
            online_at,
            last_event_type: self.last_event_type,
        }
    }
}

impl AbsenceBook for Mutex<EngineState> {
    fn absence(&self, tracker_id: &str) -> Option<AbsenceRecord> {
        self.lock().detector.get(tracker_id).cloned()
    }

    fn absent_trackers(&self) -> HashSet<String> {
        self.lock().detector.absent_ids()
    }

    fn mark_replaced(&self, tracker_id: &str, replacement: &str) {
        self.lock().detector.mark_replaced(tracker_id, replacement);
    }

    fn mark_resolved(&self, tracker_id: &str) {
        self.lock().detector.mark_resolved(tracker_id);
    }

    fn note_no_replacement(&self, tracker_id: &str) -> bool {
        self.lock().detector.note_no_replacement(tracker_id)
    }
}

struct Inner {
    config: EngineConfig,
    match_id: String,
    tracker_id: String,
    online_at: i64,
    state: Mutex<EngineState>,
    channel: Arc<dyn BroadcastChannel>,
    assigner: Option<ReplacementAssigner>,
    persistence: Arc<dyn Persistence>,
    notifier: Notifier,
    drain_wake: Notify,
    status_wake: Notify,
}

pub struct MatchSession {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MatchSession {
    /// Validate the configuration and spawn the session tasks. Must be called
    /// inside a Tokio runtime.
    pub fn start(
        config: EngineConfig,
        match_id: &str,
        tracker_id: &str,
        subscription: Subscription,
        store: Option<Arc<dyn AssignmentStore>>,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self> {
        if match_id.trim().is_empty() {
            return Err(SyncError::Config("match id is required".to_string()));
        }
        if tracker_id.trim().is_empty() {
            return Err(SyncError::Config("tracker id is required".to_string()));
        }
        let Subscription { channel, inbound } = subscription;
        if channel.match_id() != match_id {
            return Err(SyncError::Config(format!(
                "channel is subscribed to {}, not {match_id}",
                channel.match_id()
            )));
        }
        let assigner = match (config.role, store) {
            (ClientRole::Coordinator, Some(store)) => {
                Some(ReplacementAssigner::new(store, persistence.clone()))
            }
            (ClientRole::Coordinator, None) => {
                return Err(SyncError::Config(
                    "coordinator role requires an assignment store".to_string(),
                ));
            }
            (ClientRole::Tracker, _) => None,
        };

        let now = now_ms();
        let state = EngineState {
            events: EventSyncEngine::new(match_id, tracker_id, now),
            presence: PresenceTracker::new(),
            detector: AbsenceDetector::new(
                config.inactivity_threshold.as_millis() as i64,
                config.max_missed_heartbeats,
            ),
            status: StatusBroadcaster::new(tracker_id, config.status_throttle.as_millis() as i64),
            outbox: None,
            last_event_type: None,
            last_tracked: None,
            members: BTreeSet::new(),
            assignments: Vec::new(),
        };

        let inner = Arc::new(Inner {
            notifier: Notifier::new(config.notification_capacity),
            config,
            match_id: match_id.to_string(),
            tracker_id: tracker_id.to_string(),
            online_at: now,
            state: Mutex::new(state),
            channel,
            assigner,
            persistence,
            drain_wake: Notify::new(),
            status_wake: Notify::new(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![
            tokio::spawn(pump_loop(inner.clone(), inbound, shutdown_rx.clone())),
            tokio::spawn(drain_loop(inner.clone(), shutdown_rx.clone())),
            tokio::spawn(heartbeat_loop(inner.clone(), shutdown_rx.clone())),
        ];
        if inner.assigner.is_some() {
            tasks.push(tokio::spawn(scan_loop(inner.clone(), shutdown_rx)));
        }

        tracing::info!(
            match_id = %inner.match_id,
            tracker_id = %inner.tracker_id,
            role = ?inner.config.role,
            "match session started"
        );

        Ok(Self {
            inner,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn match_id(&self) -> &str {
        &self.inner.match_id
    }

    pub fn tracker_id(&self) -> &str {
        &self.inner.tracker_id
    }

    pub fn role(&self) -> ClientRole {
        self.inner.config.role
    }

    pub fn is_connected(&self) -> bool {
        self.inner.channel.is_connected()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.notifier.subscribe()
    }

    /// Wall-clock ms of kickoff; match time of new events is measured from it.
    pub fn set_kickoff(&self, kickoff_at_ms: i64) {
        self.inner.state.lock().events.set_kickoff(kickoff_at_ms);
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Show the event immediately and queue it for the channel.
    pub fn record_event(&self, draft: EventDraft) -> TrackedEvent {
        let now = now_ms();
        let event = {
            let mut st = self.inner.state.lock();
            let event = st.events.record_event(draft, now);
            st.last_event_type = Some(event.event_type);
            let action = Some(event.event_type.to_string());
            if let Some(update) = st.status.update(TrackerStatus::Recording, action, now) {
                st.outbox = Some(update);
            }
            event
        };

        tracing::info!(
            match_id = %self.inner.match_id,
            event_id = %event.id,
            event_type = %event.event_type,
            "event recorded"
        );
        self.inner.notifier.emit(EngineEvent::EventAdded {
            event: event.clone(),
        });
        self.inner.drain_wake.notify_one();
        self.inner.status_wake.notify_one();
        event
    }

    /// Re-queue a failed event under its original id.
    pub fn retry_event(&self, event_id: &str) -> Result<TrackedEvent> {
        let event = self.inner.state.lock().events.retry(event_id)?;
        tracing::info!(%event_id, "retrying event");
        self.inner.drain_wake.notify_one();
        Ok(event)
    }

    pub fn retry_failed(&self) -> Vec<TrackedEvent> {
        let retried = self.inner.state.lock().events.retry_failed();
        if !retried.is_empty() {
            tracing::info!(count = retried.len(), "retrying failed events");
            self.inner.drain_wake.notify_one();
        }
        retried
    }

    /// Merged event list in match-time order.
    pub fn events(&self) -> Vec<TrackedEvent> {
        self.inner.state.lock().events.events()
    }

    /// Events still waiting for the channel.
    pub fn outbound(&self) -> Vec<TrackedEvent> {
        self.inner.state.lock().events.outbound()
    }

    // -----------------------------------------------------------------------
    // Local status
    // -----------------------------------------------------------------------

    pub fn set_status(&self, status: TrackerStatus, action: Option<String>) {
        {
            let mut st = self.inner.state.lock();
            if let Some(update) = st.status.update(status, action, now_ms()) {
                st.outbox = Some(update);
            }
        }
        self.inner.status_wake.notify_one();
    }

    pub fn set_metrics(&self, metrics: HeartbeatMetrics) {
        self.inner.state.lock().status.set_metrics(metrics);
    }

    // -----------------------------------------------------------------------
    // Presence, absences, assignments
    // -----------------------------------------------------------------------

    pub fn presence_snapshot(&self) -> Vec<TrackerPresenceRecord> {
        self.inner.state.lock().presence.snapshot()
    }

    pub fn active_absences(&self) -> Vec<AbsenceRecord> {
        self.inner.state.lock().detector.active_absences()
    }

    /// Standing "no replacement available" warnings.
    pub fn warnings(&self) -> Vec<AbsenceRecord> {
        self.inner.state.lock().detector.warnings()
    }

    pub fn dismiss_warning(&self, tracker_id: &str) -> bool {
        self.inner.state.lock().detector.dismiss_warning(tracker_id)
    }

    pub fn assignments(&self) -> Vec<Assignment> {
        self.inner.state.lock().assignments.clone()
    }

    pub fn set_assignments(&self, assignments: Vec<Assignment>) {
        self.inner.state.lock().assignments = assignments;
    }

    /// Run one absence scan now. Returns the newly detected absences; empty
    /// for non-coordinators.
    pub async fn scan_now(&self) -> Vec<AbsenceRecord> {
        self.inner.scan().await
    }

    /// Hand an absent tracker's assignments to a replacement on demand.
    pub async fn reassign(&self, tracker_id: &str) -> Result<Vec<Assignment>> {
        match self.inner.reassign_absent(tracker_id).await? {
            ReassignOutcome::Reassigned { transfer, .. } => Ok(transfer.created),
            ReassignOutcome::NoReplacement { .. } => {
                Err(SyncError::NoReplacementAvailable(tracker_id.to_string()))
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Stop the tasks, announce departure, and leave the channel.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        let inner = &self.inner;
        let update = inner
            .state
            .lock()
            .status
            .force(TrackerStatus::Inactive, now_ms());
        if inner.channel.is_connected() {
            if let Err(err) = inner
                .channel
                .publish(&ChannelMessage::TrackerUpdate(update))
                .await
            {
                tracing::debug!(?err, "departure status not delivered");
            }
            if let Err(err) = inner.channel.untrack().await {
                tracing::debug!(?err, "untrack failed");
            }
        }
        inner.channel.close().await;
        {
            let mut st = inner.state.lock();
            st.presence.clear();
            st.members.clear();
        }

        tracing::info!(
            match_id = %inner.match_id,
            tracker_id = %inner.tracker_id,
            "match session closed"
        );
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn pump_loop(
    inner: Arc<Inner>,
    mut inbound: mpsc::UnboundedReceiver<ChannelInbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            item = inbound.recv() => match item {
                Some(item) => inner.handle_inbound(item).await,
                None => {
                    tracing::debug!(match_id = %inner.match_id, "channel inbound ended");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn drain_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = inner.drain_wake.notified() => {}
            _ = time::sleep(inner.config.drain_interval) => {}
            _ = shutdown.changed() => break,
        }
        inner.drain().await;
    }
}

async fn heartbeat_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let interval = inner.config.heartbeat_interval;
    let mut next_beat = Instant::now();

    loop {
        let pending_due = inner.state.lock().status.pending_due_in(now_ms());
        let wake_at = match pending_due {
            Some(ms) => next_beat.min(Instant::now() + time::Duration::from_millis(ms as u64)),
            None => next_beat,
        };

        tokio::select! {
            _ = time::sleep_until(wake_at) => {}
            _ = inner.status_wake.notified() => {}
            _ = shutdown.changed() => break,
        }

        let now = now_ms();
        let beat_due = Instant::now() >= next_beat;
        if beat_due {
            next_beat = Instant::now() + interval;
        }

        let update = {
            let mut st = inner.state.lock();
            match st.outbox.take() {
                Some(update) => Some(update),
                None if beat_due || st.status.pending_due_in(now) == Some(0) => st.status.tick(now),
                None => None,
            }
        };
        if let Some(update) = update {
            inner.send_status(update).await;
        }
    }
}

async fn scan_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(inner.config.scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.scan().await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine logic
// ---------------------------------------------------------------------------

impl Inner {
    fn is_self(&self, tracker_id: &str) -> bool {
        tracker_id == self.tracker_id
    }

    async fn handle_inbound(&self, item: ChannelInbound) {
        match item {
            ChannelInbound::Connected => {
                tracing::info!(match_id = %self.match_id, "channel connected");
                self.notifier
                    .emit(EngineEvent::ConnectionChanged { connected: true });
                self.track_presence().await;
                self.drain_wake.notify_one();
            }
            ChannelInbound::Disconnected => {
                tracing::warn!(match_id = %self.match_id, "channel disconnected; events will queue");
                self.notifier
                    .emit(EngineEvent::ConnectionChanged { connected: false });
            }
            ChannelInbound::Message { from, message } => self.handle_message(&from, message).await,
            ChannelInbound::PresenceSync(members) => self.handle_presence_sync(members).await,
            ChannelInbound::PresenceJoin(member) => self.handle_join(member),
            ChannelInbound::PresenceLeave { tracker_id } => self.handle_leave(&tracker_id).await,
            ChannelInbound::ResyncRequired => {
                tracing::warn!(match_id = %self.match_id, "channel history gap");
                self.notifier.notice(
                    Recipient::Tracker(self.tracker_id.clone()),
                    NoticeLevel::Warning,
                    "Some match updates were missed while offline",
                );
            }
        }
    }

    async fn handle_message(&self, from: &str, message: ChannelMessage) {
        tracing::debug!(match_id = %self.match_id, %from, topic = message.topic(), "channel message");
        let now = now_ms();

        match message {
            ChannelMessage::AddEvent(_) | ChannelMessage::EventConfirmed(_) => {
                let change = self.state.lock().events.on_channel_message(&message);
                match change {
                    Some(EventChange::Added(event)) => {
                        self.note_activity(&event.created_by, event.event_type, now);
                        self.notifier.emit(EngineEvent::EventAdded { event });
                    }
                    Some(EventChange::Confirmed(event)) => {
                        tracing::debug!(event_id = %event.id, "event confirmed");
                        self.notifier.emit(EngineEvent::EventConfirmed {
                            event: event.clone(),
                        });
                        if let Err(err) = self.persistence.persist_event(&event).await {
                            tracing::error!(?err, event_id = %event.id, "failed to persist event");
                        }
                    }
                    Some(EventChange::Failed { .. }) | None => {}
                }
            }
            ChannelMessage::TrackerUpdate(update) => {
                if !self.is_self(&update.tracker_id) {
                    self.ingest_status(update, now);
                }
            }
            ChannelMessage::EventTracked(tracked) => {
                self.note_activity(&tracked.tracker_id, tracked.event_type, now);
            }
            ChannelMessage::TrackerReassigned(reassigned) => self.on_reassigned(reassigned),
        }
    }

    fn ingest_status(&self, update: TrackerStatusUpdate, now: i64) {
        let (record, cleared) = {
            let mut st = self.state.lock();
            st.presence
                .ingest_heartbeat(&update.tracker_id, update.status, update.metrics, now);
            st.presence.set_action(&update.tracker_id, update.action.clone());
            let cleared = if update.status.is_live() {
                st.detector.clear(&update.tracker_id)
            } else {
                None
            };
            (st.presence.get(&update.tracker_id).cloned(), cleared)
        };

        if let Some(record) = record {
            self.notifier.emit(EngineEvent::PresenceChanged { record });
        }
        if cleared.is_some() {
            self.notifier.emit(EngineEvent::AbsenceCleared {
                tracker_id: update.tracker_id,
            });
        }
    }

    fn note_activity(&self, tracker_id: &str, event_type: EventType, now: i64) {
        if self.is_self(tracker_id) {
            return;
        }
        let (record, cleared) = {
            let mut st = self.state.lock();
            st.presence.ingest_activity_broadcast(tracker_id, event_type, now);
            (st.presence.get(tracker_id).cloned(), st.detector.clear(tracker_id))
        };

        if let Some(record) = record {
            self.notifier.emit(EngineEvent::PresenceChanged { record });
        }
        if cleared.is_some() {
            self.notifier.emit(EngineEvent::AbsenceCleared {
                tracker_id: tracker_id.to_string(),
            });
        }
    }

    fn on_reassigned(&self, reassigned: TrackerReassigned) {
        let TrackerReassigned {
            absent_tracker_id,
            replacement_tracker_id,
            assignments,
            ..
        } = reassigned;

        if self.is_self(&replacement_tracker_id) {
            self.receive_assignments(&absent_tracker_id, assignments.clone());
        } else if self.is_self(&absent_tracker_id) {
            self.state.lock().assignments.retain(|held| {
                !assignments
                    .iter()
                    .any(|moved| moved.replaces.as_deref() == Some(held.id.as_str()))
            });
            self.notifier.notice(
                Recipient::Tracker(self.tracker_id.clone()),
                NoticeLevel::Warning,
                format!("Your assignments were handed to {replacement_tracker_id}"),
            );
        }

        self.notifier.emit(EngineEvent::Reassigned {
            absent_tracker_id,
            replacement_tracker_id,
            assignments,
        });
    }

    fn receive_assignments(&self, absent_tracker_id: &str, assignments: Vec<Assignment>) {
        tracing::info!(
            match_id = %self.match_id,
            absent = %absent_tracker_id,
            count = assignments.len(),
            "received reassigned work"
        );
        self.state.lock().assignments.extend(assignments.iter().cloned());
        self.notifier
            .emit(EngineEvent::AssignmentReceived { assignments });
        self.notifier.notice(
            Recipient::Tracker(self.tracker_id.clone()),
            NoticeLevel::Info,
            format!("You are now covering {absent_tracker_id}'s assignments"),
        );
    }

    async fn handle_presence_sync(&self, members: Vec<PresenceMember>) {
        let now = now_ms();
        let (joined, left, cleared) = {
            let mut st = self.state.lock();
            let current: BTreeSet<String> = members
                .iter()
                .map(|m| m.tracker_id.clone())
                .filter(|id| !self.is_self(id))
                .collect();
            let joined: Vec<String> = current.difference(&st.members).cloned().collect();
            let left: Vec<String> = st.members.difference(&current).cloned().collect();

            for member in members.iter().filter(|m| joined.contains(&m.tracker_id)) {
                let status = member
                    .state
                    .as_ref()
                    .map_or(TrackerStatus::Active, |s| s.status);
                st.presence.ingest_heartbeat(
                    &member.tracker_id,
                    status,
                    HeartbeatMetrics::default(),
                    now,
                );
            }
            // Coming back into the presence set ends an absence.
            let cleared: Vec<String> = joined
                .iter()
                .filter(|id| st.detector.clear(id).is_some())
                .cloned()
                .collect();
            st.members = current;
            (joined, left, cleared)
        };

        for tracker_id in joined {
            self.notifier.emit(EngineEvent::TrackerJoined { tracker_id });
        }
        for tracker_id in cleared {
            tracing::info!(match_id = %self.match_id, %tracker_id, "absent tracker is back");
            self.notifier.emit(EngineEvent::AbsenceCleared { tracker_id });
        }
        for tracker_id in left {
            self.depart(&tracker_id).await;
        }
    }

    fn handle_join(&self, member: PresenceMember) {
        if self.is_self(&member.tracker_id) {
            return;
        }
        let status = member
            .state
            .as_ref()
            .map_or(TrackerStatus::Active, |s| s.status);
        let (is_new, record, cleared) = {
            let mut st = self.state.lock();
            let is_new = st.members.insert(member.tracker_id.clone());
            st.presence.ingest_heartbeat(
                &member.tracker_id,
                status,
                HeartbeatMetrics::default(),
                now_ms(),
            );
            if let Some(kind) = member.state.as_ref().and_then(|s| s.last_event_type) {
                st.presence
                    .set_action(&member.tracker_id, Some(kind.to_string()));
            }
            (
                is_new,
                st.presence.get(&member.tracker_id).cloned(),
                st.detector.clear(&member.tracker_id),
            )
        };

        if is_new {
            tracing::info!(match_id = %self.match_id, tracker_id = %member.tracker_id, "tracker joined");
            self.notifier.emit(EngineEvent::TrackerJoined {
                tracker_id: member.tracker_id.clone(),
            });
        }
        if let Some(record) = record {
            self.notifier.emit(EngineEvent::PresenceChanged { record });
        }
        if cleared.is_some() {
            self.notifier.emit(EngineEvent::AbsenceCleared {
                tracker_id: member.tracker_id,
            });
        }
    }

    async fn handle_leave(&self, tracker_id: &str) {
        if self.is_self(tracker_id) {
            return;
        }
        let was_member = self.state.lock().members.remove(tracker_id);
        if was_member {
            self.depart(tracker_id).await;
        }
    }

    /// A peer left the presence set: forget its liveness and, as coordinator,
    /// flag it without waiting for the inactivity timeout.
    async fn depart(&self, tracker_id: &str) {
        tracing::info!(match_id = %self.match_id, %tracker_id, "tracker left");
        let flagged = {
            let mut st = self.state.lock();
            st.presence.remove(tracker_id);
            if self.assigner.is_some() {
                st.detector.flag_departed(tracker_id, now_ms())
            } else {
                None
            }
        };
        self.notifier.emit(EngineEvent::TrackerLeft {
            tracker_id: tracker_id.to_string(),
        });
        if let Some(record) = flagged {
            self.on_absences(vec![record]).await;
        }
    }

    async fn track_presence(&self) {
        let presence = self
            .state
            .lock()
            .presence_state(&self.tracker_id, self.online_at);
        match self.channel.track(&presence).await {
            Ok(()) => self.state.lock().last_tracked = Some(presence),
            Err(err) => tracing::debug!(?err, "presence track failed"),
        }
    }

    async fn send_status(&self, update: TrackerStatusUpdate) {
        if !self.channel.is_connected() {
            return;
        }
        tracing::trace!(status = ?update.status, "status broadcast");
        if let Err(err) = self
            .channel
            .publish(&ChannelMessage::TrackerUpdate(update))
            .await
        {
            tracing::debug!(?err, "status broadcast dropped");
        }

        let retrack = {
            let st = self.state.lock();
            let presence = st.presence_state(&self.tracker_id, self.online_at);
            st.last_tracked.as_ref() != Some(&presence)
        };
        if retrack {
            self.track_presence().await;
        }
    }

    /// Publish queued events, oldest first, until the queue is empty or the
    /// channel goes away.
    async fn drain(&self) {
        loop {
            if !self.channel.is_connected() {
                return;
            }
            let next = self.state.lock().events.next_outbound();
            let Some(event) = next else {
                return;
            };

            match self
                .channel
                .publish(&ChannelMessage::AddEvent(event.clone()))
                .await
            {
                Ok(()) => {
                    self.state.lock().events.mark_sent(&event.id);
                    tracing::debug!(event_id = %event.id, "event sent");
                    let tracked = ChannelMessage::EventTracked(EventTracked {
                        tracker_id: self.tracker_id.clone(),
                        event_type: event.event_type,
                        event_id: Some(event.id.clone()),
                        timestamp: now_ms(),
                    });
                    if let Err(err) = self.channel.publish(&tracked).await {
                        tracing::debug!(?err, "activity notice dropped");
                    }
                }
                Err(err) if err.is_unavailable() => {
                    tracing::debug!(event_id = %event.id, "channel unavailable; event stays queued");
                    return;
                }
                Err(err) => {
                    let reason = SyncError::from(err).to_string();
                    tracing::warn!(event_id = %event.id, %reason, "event send failed");
                    let change = self.state.lock().events.mark_failed(&event.id, reason);
                    if let Some(EventChange::Failed { event, reason }) = change {
                        self.notifier
                            .emit(EngineEvent::EventFailed { event, reason });
                    }
                }
            }
        }
    }

    async fn scan(&self) -> Vec<AbsenceRecord> {
        if self.assigner.is_none() {
            return Vec::new();
        }
        let (detected, retry) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let detected = st.detector.scan(now_ms(), &mut st.presence);
            let retry: Vec<String> = st
                .detector
                .unresolved()
                .into_iter()
                .filter(|id| !detected.iter().any(|r| &r.tracker_id == id))
                .collect();
            (detected, retry)
        };

        self.on_absences(detected.clone()).await;
        for tracker_id in retry {
            if let Err(err) = self.reassign_absent(&tracker_id).await {
                tracing::warn!(?err, %tracker_id, "reassignment retry failed");
            }
        }
        detected
    }

    async fn on_absences(&self, detected: Vec<AbsenceRecord>) {
        for absence in detected {
            let tracker_id = absence.tracker_id.clone();
            self.notifier.notice(
                Recipient::Coordinators,
                NoticeLevel::Warning,
                format!("Tracker {tracker_id} is absent: {}", absence.reason),
            );
            self.notifier.emit(EngineEvent::AbsenceDetected { absence });
            if let Err(err) = self.reassign_absent(&tracker_id).await {
                tracing::warn!(?err, %tracker_id, "reassignment failed");
            }
        }
    }

    async fn reassign_absent(&self, tracker_id: &str) -> Result<ReassignOutcome> {
        let Some(assigner) = &self.assigner else {
            return Err(SyncError::Config(
                "reassignment requires the coordinator role".to_string(),
            ));
        };
        let reason = self
            .state
            .lock()
            .detector
            .get(tracker_id)
            .map(|r| r.reason.to_string())
            .unwrap_or_default();

        let outcome = assigner
            .reassign(tracker_id, &self.match_id, &self.state)
            .await?;

        match &outcome {
            ReassignOutcome::Reassigned {
                absent_tracker_id,
                replacement_tracker_id,
                transfer,
            } => {
                let message = ChannelMessage::TrackerReassigned(TrackerReassigned {
                    absent_tracker_id: absent_tracker_id.clone(),
                    replacement_tracker_id: replacement_tracker_id.clone(),
                    assignments: transfer.created.clone(),
                    reason,
                    timestamp: now_ms(),
                });
                if let Err(err) = self.channel.publish(&message).await {
                    tracing::warn!(?err, %absent_tracker_id, "reassignment broadcast failed");
                }
                if self.is_self(replacement_tracker_id) {
                    self.receive_assignments(absent_tracker_id, transfer.created.clone());
                }

                self.notifier.notice(
                    Recipient::Tracker(absent_tracker_id.clone()),
                    NoticeLevel::Warning,
                    format!(
                        "You were marked absent; {replacement_tracker_id} has been assigned your work"
                    ),
                );
                self.notifier.notice(
                    Recipient::Tracker(replacement_tracker_id.clone()),
                    NoticeLevel::Info,
                    format!("You have been assigned to cover for {absent_tracker_id}"),
                );
                self.notifier.notice(
                    Recipient::Coordinators,
                    NoticeLevel::Info,
                    format!("{replacement_tracker_id} replaces {absent_tracker_id}"),
                );
                self.notifier.emit(EngineEvent::Reassigned {
                    absent_tracker_id: absent_tracker_id.clone(),
                    replacement_tracker_id: replacement_tracker_id.clone(),
                    assignments: transfer.created.clone(),
                });
            }
            ReassignOutcome::NoReplacement {
                absent_tracker_id,
                first_notice: true,
            } => {
                self.notifier.notice(
                    Recipient::Coordinators,
                    NoticeLevel::Warning,
                    format!("No replacement available for {absent_tracker_id}"),
                );
                self.notifier.emit(EngineEvent::NoReplacementAvailable {
                    absent_tracker_id: absent_tracker_id.clone(),
                });
            }
            other => tracing::debug!(?other, "reassignment skipped"),
        }
        Ok(outcome)
    }
}
