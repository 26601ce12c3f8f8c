mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::*;
use match_relay::config::Config;
use match_relay::AppState;
use pitchside_common::protocol::{ChannelMessage, EventStatus, EventType, TeamSide, TrackerStatus};
use pitchside_sync::channel::relay::{RelayChannel, RelayOptions};
use pitchside_sync::channel::{ChannelInbound, Subscription};
use pitchside_sync::persist::NoopPersistence;
use pitchside_sync::{ClientRole, EventDraft, MatchSession};

/// Start a relay on an ephemeral port. The server runs in the background.
async fn start_relay() -> SocketAddr {
    let config = Config {
        port: 0,
        heartbeat_interval_ms: 200,
        ..Config::default()
    };
    let state = AppState::new(config);
    let app = match_relay::routes::router().with_state(state.clone());
    match_relay::gateway::spawn_presence_sweeper(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn relay_subscription(addr: SocketAddr, tracker_id: &str) -> Subscription {
    let options = RelayOptions::new(format!("ws://{addr}"), &fast_config(ClientRole::Tracker));
    RelayChannel::connect(options, MATCH_ID, tracker_id)
}

fn relay_session(addr: SocketAddr, tracker_id: &str) -> MatchSession {
    MatchSession::start(
        fast_config(ClientRole::Tracker),
        MATCH_ID,
        tracker_id,
        relay_subscription(addr, tracker_id),
        None,
        Arc::new(NoopPersistence),
    )
    .expect("start relay session")
}

#[tokio::test]
async fn relay_channel_connects_and_publishes() {
    let addr = start_relay().await;
    let mut a = relay_subscription(addr, "t1");
    let mut b = relay_subscription(addr, "t2");

    next_inbound(&mut a, |i| matches!(i, ChannelInbound::Connected)).await;
    next_inbound(&mut b, |i| matches!(i, ChannelInbound::Connected)).await;
    assert!(a.channel.is_connected());

    let goal = pitchside_common::protocol::TrackedEvent {
        id: "evt_relay".to_string(),
        match_id: MATCH_ID.to_string(),
        event_type: EventType::Goal,
        team_id: TeamSide::Away,
        player_id: Some(11),
        timestamp_ms: 42_000,
        coordinates: None,
        created_by: "t1".to_string(),
        status: EventStatus::Optimistic,
    };
    a.channel
        .publish(&ChannelMessage::AddEvent(goal.clone()))
        .await
        .expect("publish acknowledged");

    let received = next_inbound(&mut b, |i| {
        matches!(i, ChannelInbound::Message { message: ChannelMessage::AddEvent(_), .. })
    })
    .await;
    assert_eq!(
        received,
        ChannelInbound::Message {
            from: "t1".to_string(),
            message: ChannelMessage::AddEvent(goal.clone()),
        }
    );

    // The sender only hears the relay's confirmation.
    let confirmed = next_inbound(&mut a, |i| matches!(i, ChannelInbound::Message { .. })).await;
    assert!(matches!(
        confirmed,
        ChannelInbound::Message { message: ChannelMessage::EventConfirmed(ref e), .. } if e.id == goal.id
    ));

    a.channel.close().await;
    b.channel.close().await;
}

#[tokio::test]
async fn sessions_sync_events_and_presence_through_the_relay() {
    let addr = start_relay().await;
    let a = relay_session(addr, "t1");
    let b = relay_session(addr, "t2");

    assert!(eventually(|| a.is_connected() && b.is_connected()).await);
    assert!(eventually(|| b.presence_snapshot().iter().any(|r| r.tracker_id == "t1")).await);

    let event = a.record_event(EventDraft::new(EventType::Corner, TeamSide::Home));
    assert!(eventually(|| a.events().first().map(|e| e.status) == Some(EventStatus::Confirmed)).await);
    assert!(eventually(|| b.events().iter().any(|e| e.id == event.id)).await);
    assert_eq!(b.events().len(), 1);
    assert_eq!(a.events().len(), 1);

    a.set_status(TrackerStatus::Recording, Some("corner".to_string()));
    assert!(eventually(|| {
        b.presence_snapshot()
            .iter()
            .any(|r| r.tracker_id == "t1" && r.status == TrackerStatus::Recording)
    })
    .await);

    a.shutdown().await;
    assert!(eventually(|| b.presence_snapshot().iter().all(|r| r.tracker_id != "t1")).await);
    b.shutdown().await;
}
