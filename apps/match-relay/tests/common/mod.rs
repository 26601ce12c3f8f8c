#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use match_relay::config::Config;
use match_relay::AppState;
use pitchside_common::protocol::{
    ChannelMessage, ClientFrame, EventStatus, EventType, ServerFrame, TeamSide, TrackedEvent,
};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const MATCH_ID: &str = "match_1";

/// Relay config with short timings for tests.
pub fn test_config() -> Config {
    Config {
        port: 0,
        heartbeat_interval_ms: 1_000,
        presence_grace: Duration::from_millis(100),
        replay_buffer_size: 100,
        confirm_events: true,
        broadcast_capacity: 4096,
    }
}

pub fn test_app(config: Config) -> (Router, AppState) {
    let state = AppState::new(config);
    let app = match_relay::routes::router().with_state(state.clone());
    (app, state)
}

/// Start an actual TCP server for WebSocket testing, plus the presence
/// sweeper. The server runs in the background.
pub async fn start_ws_server(config: Config) -> (SocketAddr, AppState) {
    let (app, state) = test_app(config);
    match_relay::gateway::spawn_presence_sweeper(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

pub async fn connect(addr: SocketAddr, match_id: &str) -> Ws {
    let url = format!("ws://{addr}/matches/{match_id}/channel");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

pub async fn send(ws: &mut Ws, frame: &ClientFrame) {
    let json = serde_json::to_string(frame).expect("encode frame");
    ws.send(tungstenite::Message::Text(json.into()))
        .await
        .expect("send frame");
}

/// Next raw message, failing the test after 5 seconds.
pub async fn next_message(ws: &mut Ws) -> tungstenite::Message {
    time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timeout")
        .expect("stream ended")
        .expect("read error")
}

/// Next text frame decoded as a relay frame.
pub async fn next_frame(ws: &mut Ws) -> ServerFrame {
    loop {
        match next_message(ws).await {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("parse relay frame");
            }
            tungstenite::Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => continue,
        }
    }
}

/// Skip frames until one matches `pred`.
pub async fn next_matching(ws: &mut Ws, mut pred: impl FnMut(&ServerFrame) -> bool) -> ServerFrame {
    loop {
        let frame = next_frame(ws).await;
        if pred(&frame) {
            return frame;
        }
    }
}

/// Assert nothing arrives for `wait`.
pub async fn assert_silent(ws: &mut Ws, wait: Duration) {
    if let Ok(Some(Ok(msg))) = time::timeout(wait, ws.next()).await {
        panic!("expected no frame, got {msg:?}");
    }
}

/// Connect, send `join`, and read `joined` plus the presence sync.
/// Returns the socket and the `joined` frame.
pub async fn join(
    addr: SocketAddr,
    match_id: &str,
    tracker_id: &str,
    since_seq: Option<u64>,
) -> (Ws, ServerFrame) {
    let mut ws = connect(addr, match_id).await;
    send(
        &mut ws,
        &ClientFrame::Join {
            tracker_id: tracker_id.to_string(),
            since_seq,
        },
    )
    .await;

    let joined = next_frame(&mut ws).await;
    assert!(matches!(joined, ServerFrame::Joined { .. }), "got {joined:?}");
    if since_seq.is_none() {
        let sync = next_frame(&mut ws).await;
        assert!(matches!(sync, ServerFrame::PresenceSync { .. }), "got {sync:?}");
    }
    (ws, joined)
}

pub fn event(id: &str, match_id: &str, created_by: &str) -> TrackedEvent {
    TrackedEvent {
        id: id.to_string(),
        match_id: match_id.to_string(),
        event_type: EventType::Goal,
        team_id: TeamSide::Home,
        player_id: Some(10),
        timestamp_ms: 1_000,
        coordinates: None,
        created_by: created_by.to_string(),
        status: EventStatus::Optimistic,
    }
}

pub fn publish_event(reference: u64, event: TrackedEvent) -> ClientFrame {
    ClientFrame::Publish {
        reference,
        message: ChannelMessage::AddEvent(event),
    }
}
