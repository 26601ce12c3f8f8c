#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pitchside_common::protocol::{PresenceState, TrackerStatus};
use pitchside_sync::assignment::{AssignmentStore, MemoryAssignmentStore};
use pitchside_sync::channel::memory::MemoryHub;
use pitchside_sync::channel::{ChannelInbound, Subscription};
use pitchside_sync::persist::{NoopPersistence, Persistence};
use pitchside_sync::{ClientRole, EngineConfig, EngineEvent, MatchSession};
use tokio::sync::broadcast;
use tokio::time;

pub const MATCH_ID: &str = "match_1";

/// Millisecond-scale timings so scenarios finish quickly. Periodic scans are
/// effectively disabled; tests call `scan_now` explicitly.
pub fn fast_config(role: ClientRole) -> EngineConfig {
    EngineConfig {
        role,
        heartbeat_interval: Duration::from_millis(50),
        status_throttle: Duration::from_millis(50),
        scan_interval: Duration::from_secs(3600),
        inactivity_threshold: Duration::from_millis(300),
        max_missed_heartbeats: 3,
        send_timeout: Duration::from_secs(1),
        drain_interval: Duration::from_millis(50),
        reconnect_backoff_min: Duration::from_millis(20),
        reconnect_backoff_max: Duration::from_millis(200),
        notification_capacity: 1024,
    }
}

pub fn start_tracker(hub: &MemoryHub, tracker_id: &str) -> MatchSession {
    start_tracker_with(hub, tracker_id, Arc::new(NoopPersistence))
}

pub fn start_tracker_with(
    hub: &MemoryHub,
    tracker_id: &str,
    persistence: Arc<dyn Persistence>,
) -> MatchSession {
    MatchSession::start(
        fast_config(ClientRole::Tracker),
        MATCH_ID,
        tracker_id,
        hub.subscribe(MATCH_ID, tracker_id),
        None,
        persistence,
    )
    .expect("start tracker session")
}

pub fn start_coordinator(hub: &MemoryHub, store: Arc<MemoryAssignmentStore>) -> MatchSession {
    let store: Arc<dyn AssignmentStore> = store;
    MatchSession::start(
        fast_config(ClientRole::Coordinator),
        MATCH_ID,
        "coordinator",
        hub.subscribe(MATCH_ID, "coordinator"),
        Some(store),
        Arc::new(NoopPersistence),
    )
    .expect("start coordinator session")
}

/// A bare channel member that tracks presence and then stays silent.
pub async fn silent_tracker(hub: &MemoryHub, tracker_id: &str) -> Subscription {
    let sub = hub.subscribe(MATCH_ID, tracker_id);
    sub.channel
        .track(&PresenceState {
            tracker_id: tracker_id.to_string(),
            status: TrackerStatus::Active,
            online_at: 0,
            last_event_type: None,
        })
        .await
        .expect("track presence");
    sub
}

/// Poll `check` every 10ms for up to 3 seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = time::Instant::now() + Duration::from_secs(3);
    while time::Instant::now() < deadline {
        if check() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Next notification matching `pred`, skipping the rest.
pub async fn next_event(
    rx: &mut broadcast::Receiver<EngineEvent>,
    mut pred: impl FnMut(&EngineEvent) -> bool,
) -> EngineEvent {
    time::timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("notifier closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for engine event")
}

/// Next inbound item on a bare subscription matching `pred`.
pub async fn next_inbound(
    sub: &mut Subscription,
    mut pred: impl FnMut(&ChannelInbound) -> bool,
) -> ChannelInbound {
    time::timeout(Duration::from_secs(3), async {
        loop {
            let item = sub.inbound.recv().await.expect("inbound closed");
            if pred(&item) {
                return item;
            }
        }
    })
    .await
    .expect("timed out waiting for channel item")
}
