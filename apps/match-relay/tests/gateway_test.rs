mod common;

use std::time::Duration;

use common::*;
use pitchside_common::protocol::{
    ChannelMessage, ClientFrame, PresenceState, ServerFrame, TrackerStatus, TrackerStatusUpdate,
    RELAY_SENDER,
};
use tokio_tungstenite::tungstenite;

fn status_update(tracker_id: &str) -> ChannelMessage {
    ChannelMessage::TrackerUpdate(TrackerStatusUpdate {
        kind: Default::default(),
        tracker_id: tracker_id.to_string(),
        status: TrackerStatus::Active,
        action: None,
        timestamp: 0,
        metrics: Default::default(),
    })
}

fn presence(tracker_id: &str) -> serde_json::Value {
    PresenceState {
        tracker_id: tracker_id.to_string(),
        status: TrackerStatus::Active,
        online_at: 1,
        last_event_type: None,
    }
    .to_value()
}

async fn expect_close(ws: &mut Ws, code: u16) {
    loop {
        match next_message(ws).await {
            tungstenite::Message::Close(Some(frame)) => {
                assert_eq!(
                    frame.code,
                    tungstenite::protocol::frame::coding::CloseCode::from(code)
                );
                return;
            }
            tungstenite::Message::Close(None) => return,
            tungstenite::Message::Text(_) => continue,
            other => panic!("Expected Close frame, got: {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn join_returns_joined_and_presence_sync() {
    let (addr, _state) = start_ws_server(test_config()).await;
    let mut ws = connect(addr, MATCH_ID).await;
    send(
        &mut ws,
        &ClientFrame::Join {
            tracker_id: "t1".to_string(),
            since_seq: None,
        },
    )
    .await;

    match next_frame(&mut ws).await {
        ServerFrame::Joined {
            session_id,
            match_id,
            seq,
            heartbeat_interval_ms,
        } => {
            assert!(session_id.starts_with("ses_"));
            assert_eq!(match_id, MATCH_ID);
            assert_eq!(seq, 0);
            assert_eq!(heartbeat_interval_ms, 1_000);
        }
        other => panic!("expected joined, got {other:?}"),
    }
    assert_eq!(
        next_frame(&mut ws).await,
        ServerFrame::PresenceSync { presences: vec![] }
    );
}

#[tokio::test]
async fn first_frame_must_be_join() {
    let (addr, _state) = start_ws_server(test_config()).await;
    let mut ws = connect(addr, MATCH_ID).await;
    send(&mut ws, &ClientFrame::Heartbeat { reference: 1 }).await;
    expect_close(&mut ws, 4003).await;
}

#[tokio::test]
async fn join_without_tracker_id_is_refused() {
    let (addr, _state) = start_ws_server(test_config()).await;
    let mut ws = connect(addr, MATCH_ID).await;
    send(
        &mut ws,
        &ClientFrame::Join {
            tracker_id: " ".to_string(),
            since_seq: None,
        },
    )
    .await;

    assert!(matches!(next_frame(&mut ws).await, ServerFrame::Error { .. }));
    expect_close(&mut ws, 4004).await;
}

#[tokio::test]
async fn second_join_closes_connection() {
    let (addr, _state) = start_ws_server(test_config()).await;
    let (mut ws, _) = join(addr, MATCH_ID, "t1", None).await;
    send(
        &mut ws,
        &ClientFrame::Join {
            tracker_id: "t1".to_string(),
            since_seq: None,
        },
    )
    .await;
    expect_close(&mut ws, 4005).await;
}

#[tokio::test]
async fn heartbeat_returns_ack() {
    let (addr, _state) = start_ws_server(test_config()).await;
    let (mut ws, _) = join(addr, MATCH_ID, "t1", None).await;
    send(&mut ws, &ClientFrame::Heartbeat { reference: 7 }).await;
    assert_eq!(
        next_frame(&mut ws).await,
        ServerFrame::HeartbeatAck { reference: 7 }
    );
}

#[tokio::test]
async fn silent_socket_hits_heartbeat_timeout() {
    let mut config = test_config();
    config.heartbeat_interval_ms = 100;
    let (addr, _state) = start_ws_server(config).await;
    let (mut ws, _) = join(addr, MATCH_ID, "t1", None).await;
    expect_close(&mut ws, 4009).await;
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_reaches_peers_and_relay_confirms_to_all() {
    let (addr, _state) = start_ws_server(test_config()).await;
    let (mut t1, _) = join(addr, MATCH_ID, "t1", None).await;
    let (mut t2, _) = join(addr, MATCH_ID, "t2", None).await;

    let goal = event("evt_1", MATCH_ID, "t1");
    send(&mut t1, &publish_event(1, goal.clone())).await;

    // Sender: ack, then the confirmation. Never its own add_event.
    assert_eq!(next_frame(&mut t1).await, ServerFrame::Ack { reference: 1 });
    assert_eq!(
        next_frame(&mut t1).await,
        ServerFrame::Broadcast {
            seq: 2,
            from: RELAY_SENDER.to_string(),
            message: ChannelMessage::EventConfirmed(goal.clone()),
        }
    );

    // Peer: the add_event, then the confirmation.
    assert_eq!(
        next_frame(&mut t2).await,
        ServerFrame::Broadcast {
            seq: 1,
            from: "t1".to_string(),
            message: ChannelMessage::AddEvent(goal.clone()),
        }
    );
    assert!(matches!(
        next_frame(&mut t2).await,
        ServerFrame::Broadcast { seq: 2, message: ChannelMessage::EventConfirmed(_), .. }
    ));
}

#[tokio::test]
async fn confirmations_can_be_disabled() {
    let mut config = test_config();
    config.confirm_events = false;
    let (addr, _state) = start_ws_server(config).await;
    let (mut t1, _) = join(addr, MATCH_ID, "t1", None).await;
    let (mut t2, _) = join(addr, MATCH_ID, "t2", None).await;

    send(&mut t1, &publish_event(1, event("evt_1", MATCH_ID, "t1"))).await;
    assert_eq!(next_frame(&mut t1).await, ServerFrame::Ack { reference: 1 });
    assert!(matches!(
        next_frame(&mut t2).await,
        ServerFrame::Broadcast { message: ChannelMessage::AddEvent(_), .. }
    ));
    assert_silent(&mut t1, Duration::from_millis(200)).await;
    assert_silent(&mut t2, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn event_for_another_match_is_rejected() {
    let (addr, _state) = start_ws_server(test_config()).await;
    let (mut t1, _) = join(addr, MATCH_ID, "t1", None).await;

    send(&mut t1, &publish_event(3, event("evt_x", "other_match", "t1"))).await;
    match next_frame(&mut t1).await {
        ServerFrame::Rejected { reference, reason } => {
            assert_eq!(reference, 3);
            assert!(reason.contains("other_match"), "reason was {reason}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn clients_cannot_send_confirmations() {
    let (addr, _state) = start_ws_server(test_config()).await;
    let (mut t1, _) = join(addr, MATCH_ID, "t1", None).await;

    send(
        &mut t1,
        &ClientFrame::Publish {
            reference: 4,
            message: ChannelMessage::EventConfirmed(event("evt_1", MATCH_ID, "t1")),
        },
    )
    .await;
    assert!(matches!(
        next_frame(&mut t1).await,
        ServerFrame::Rejected { reference: 4, .. }
    ));
}

#[tokio::test]
async fn matches_are_isolated() {
    let (addr, _state) = start_ws_server(test_config()).await;
    let (mut t1, _) = join(addr, MATCH_ID, "t1", None).await;
    let (mut other, _) = join(addr, "match_2", "t9", None).await;

    send(
        &mut t1,
        &ClientFrame::Publish {
            reference: 1,
            message: status_update("t1"),
        },
    )
    .await;
    assert_eq!(next_frame(&mut t1).await, ServerFrame::Ack { reference: 1 });
    assert_silent(&mut other, Duration::from_millis(200)).await;
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn track_and_untrack_are_announced_to_peers() {
    let (addr, _state) = start_ws_server(test_config()).await;
    let (mut t1, _) = join(addr, MATCH_ID, "t1", None).await;
    let (mut t2, _) = join(addr, MATCH_ID, "t2", None).await;

    send(
        &mut t1,
        &ClientFrame::Track {
            reference: 1,
            state: presence("t1"),
        },
    )
    .await;
    assert_eq!(next_frame(&mut t1).await, ServerFrame::Ack { reference: 1 });
    assert_eq!(
        next_frame(&mut t2).await,
        ServerFrame::PresenceJoin {
            tracker_id: "t1".to_string(),
            state: presence("t1"),
        }
    );

    // A late joiner sees t1 in its presence sync.
    let mut t3 = connect(addr, MATCH_ID).await;
    send(
        &mut t3,
        &ClientFrame::Join {
            tracker_id: "t3".to_string(),
            since_seq: None,
        },
    )
    .await;
    let sync = next_matching(&mut t3, |f| matches!(f, ServerFrame::PresenceSync { .. })).await;
    let ServerFrame::PresenceSync { presences } = sync else {
        unreachable!()
    };
    assert_eq!(presences.len(), 1);
    assert_eq!(presences[0].tracker_id, "t1");

    send(&mut t1, &ClientFrame::Untrack { reference: 2 }).await;
    assert_eq!(next_frame(&mut t1).await, ServerFrame::Ack { reference: 2 });
    assert_eq!(
        next_frame(&mut t2).await,
        ServerFrame::PresenceLeave {
            tracker_id: "t1".to_string()
        }
    );
}

#[tokio::test]
async fn dropped_socket_leaves_after_grace_period() {
    let (addr, state) = start_ws_server(test_config()).await;
    let (mut t1, _) = join(addr, MATCH_ID, "t1", None).await;
    let (mut t2, _) = join(addr, MATCH_ID, "t2", None).await;

    send(
        &mut t1,
        &ClientFrame::Track {
            reference: 1,
            state: presence("t1"),
        },
    )
    .await;
    assert_eq!(next_frame(&mut t1).await, ServerFrame::Ack { reference: 1 });
    next_matching(&mut t2, |f| matches!(f, ServerFrame::PresenceJoin { .. })).await;

    drop(t1);

    assert_eq!(
        next_matching(&mut t2, |f| matches!(f, ServerFrame::PresenceLeave { .. })).await,
        ServerFrame::PresenceLeave {
            tracker_id: "t1".to_string()
        }
    );
    assert!(state.presence.list(MATCH_ID).is_empty());
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_replays_missed_broadcasts_except_own() {
    let (addr, _state) = start_ws_server(test_config()).await;
    let (mut t1, _) = join(addr, MATCH_ID, "t1", None).await;
    let (mut t2, _) = join(addr, MATCH_ID, "t2", None).await;

    // seq 1 (t2's add_event) and seq 2 (confirmation).
    send(&mut t2, &publish_event(1, event("evt_1", MATCH_ID, "t2"))).await;
    assert_eq!(next_frame(&mut t2).await, ServerFrame::Ack { reference: 1 });
    // seq 3, published by t1 itself.
    send(
        &mut t1,
        &ClientFrame::Publish {
            reference: 1,
            message: status_update("t1"),
        },
    )
    .await;
    next_matching(&mut t1, |f| matches!(f, ServerFrame::Ack { .. })).await;

    // Reconnect having only seen seq 1.
    let (mut resumed, joined) = join(addr, MATCH_ID, "t1", Some(1)).await;
    assert!(matches!(joined, ServerFrame::Joined { seq: 3, .. }));
    assert!(matches!(
        next_frame(&mut resumed).await,
        ServerFrame::Broadcast { seq: 2, message: ChannelMessage::EventConfirmed(_), .. }
    ));
    assert!(matches!(
        next_frame(&mut resumed).await,
        ServerFrame::PresenceSync { .. }
    ));
}

#[tokio::test]
async fn resume_past_the_buffer_requires_resync() {
    let mut config = test_config();
    config.replay_buffer_size = 2;
    let (addr, _state) = start_ws_server(config).await;
    let (mut t2, _) = join(addr, MATCH_ID, "t2", None).await;

    for reference in 1..=3 {
        send(
            &mut t2,
            &ClientFrame::Publish {
                reference,
                message: status_update("t2"),
            },
        )
        .await;
        assert_eq!(next_frame(&mut t2).await, ServerFrame::Ack { reference });
    }

    let (mut resumed, _) = join(addr, MATCH_ID, "t1", Some(0)).await;
    assert_eq!(
        next_frame(&mut resumed).await,
        ServerFrame::ResyncRequired { seq: 3 }
    );
}

#[tokio::test]
async fn lagging_socket_catches_up_from_the_replay_log() {
    let mut config = test_config();
    config.confirm_events = false;
    config.broadcast_capacity = 1;
    let (addr, _state) = start_ws_server(config).await;
    let (mut t1, _) = join(addr, MATCH_ID, "t1", None).await;
    let (mut t2, _) = join(addr, MATCH_ID, "t2", None).await;

    // Publish faster than a one-slot fan-out can hold.
    for reference in 1..=20 {
        send(
            &mut t1,
            &publish_event(reference, event(&format!("evt_{reference}"), MATCH_ID, "t1")),
        )
        .await;
    }
    for _ in 1..=20 {
        next_matching(&mut t1, |f| matches!(f, ServerFrame::Ack { .. })).await;
    }

    let mut seen = Vec::new();
    while seen.len() < 20 {
        match next_frame(&mut t2).await {
            ServerFrame::Broadcast {
                seq,
                message: ChannelMessage::AddEvent(event),
                ..
            } => seen.push((seq, event.id)),
            ServerFrame::PresenceSync { .. } => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    let expected: Vec<(u64, String)> = (1..=20).map(|n| (n, format!("evt_{n}"))).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn replay_log_is_dropped_once_the_match_empties() {
    let (addr, state) = start_ws_server(test_config()).await;
    let (mut t1, _) = join(addr, MATCH_ID, "t1", None).await;
    let (t2, _) = join(addr, MATCH_ID, "t2", None).await;

    send(
        &mut t1,
        &ClientFrame::Publish {
            reference: 1,
            message: status_update("t1"),
        },
    )
    .await;
    assert_eq!(next_frame(&mut t1).await, ServerFrame::Ack { reference: 1 });

    // One socket left keeps the log through several sweeps.
    drop(t1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(state.replay.latest_seq(MATCH_ID), 1);

    drop(t2);
    tokio::time::timeout(Duration::from_secs(3), async {
        while state.replay.latest_seq(MATCH_ID) != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("replay log was not dropped");

    let (mut resumed, joined) = join(addr, MATCH_ID, "t1", Some(1)).await;
    assert!(matches!(joined, ServerFrame::Joined { seq: 0, .. }));
    assert_eq!(
        next_frame(&mut resumed).await,
        ServerFrame::ResyncRequired { seq: 0 }
    );
}
