//! WebSocket upgrade handler and per-connection event loop.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pitchside_common::protocol::{ChannelMessage, ClientFrame, ServerFrame, RELAY_SENDER};
use tokio::sync::broadcast;
use tokio::time;

use crate::AppState;

use super::fanout::FanoutPayload;
use super::session::ChannelSession;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_NOT_JOINED: u16 = 4003;
const CLOSE_JOIN_FAILED: u16 = 4004;
const CLOSE_ALREADY_JOINED: u16 = 4005;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving JOIN after connection (seconds).
const JOIN_TIMEOUT_SECS: u64 = 10;

pub fn router() -> Router<AppState> {
    Router::new().route("/matches/{match_id}/channel", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(match_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, match_id, state))
}

async fn handle_connection(socket: WebSocket, match_id: String, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: Wait for JOIN within timeout.
    let join_result = time::timeout(Duration::from_secs(JOIN_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during join");
                    return Err("read error");
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err("client closed"),
                _ => continue,
            };

            return match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Join {
                    tracker_id,
                    since_seq,
                }) => Ok((tracker_id, since_seq)),
                Ok(_) => {
                    let _ = send_close(&mut ws_tx, CLOSE_NOT_JOINED, "Expected join").await;
                    Err("expected join")
                }
                Err(_) => {
                    let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                    Err("invalid json")
                }
            };
        }
        Err("connection closed before join")
    })
    .await;

    let (tracker_id, since_seq) = match join_result {
        Ok(Ok(join)) => join,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, %match_id, "join handshake failed");
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Join timeout").await;
            return;
        }
    };

    if tracker_id.trim().is_empty() {
        let error = ServerFrame::Error {
            reason: "tracker_id is required".to_string(),
        };
        let _ = send_frame(&mut ws_tx, &error).await;
        let _ = send_close(&mut ws_tx, CLOSE_JOIN_FAILED, "Missing tracker id").await;
        return;
    }

    // Step 2: Subscribe before reading the log so nothing published in
    // between is missed. Overlap is dropped by sequence number.
    let _attachment = state.replay.attach(&match_id);
    let mut session = ChannelSession::new(match_id, tracker_id);
    let broadcast_rx = state.fanout.subscribe();

    let latest = state.replay.latest_seq(&session.match_id);
    let joined = ServerFrame::Joined {
        session_id: session.session_id.clone(),
        match_id: session.match_id.clone(),
        seq: latest,
        heartbeat_interval_ms: state.config.heartbeat_interval_ms,
    };
    if send_frame(&mut ws_tx, &joined).await.is_err() {
        return;
    }

    let (frames, delivered) = match since_seq {
        Some(after_seq) => catch_up(&state, &session, after_seq),
        None => (vec![presence_sync(&state, &session)], latest),
    };
    for frame in &frames {
        if send_frame(&mut ws_tx, frame).await.is_err() {
            return;
        }
    }

    tracing::info!(
        session_id = %session.session_id,
        match_id = %session.match_id,
        tracker_id = %session.tracker_id,
        resumed = since_seq.is_some(),
        "channel session joined"
    );

    // Step 3: Run the main event loop.
    run_session(&state, &mut session, delivered, ws_tx, ws_rx, broadcast_rx).await;

    // A socket that vanished while tracking enters the grace period.
    if session.is_tracked() {
        state
            .presence
            .disconnect(&session.match_id, &session.tracker_id);
    }

    tracing::info!(
        session_id = %session.session_id,
        tracker_id = %session.tracker_id,
        "channel session ended"
    );
}

/// Main session event loop: read client frames, forward broadcasts, enforce heartbeat.
async fn run_session(
    state: &AppState,
    session: &mut ChannelSession,
    mut delivered: u64,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut broadcast_rx: broadcast::Receiver<std::sync::Arc<FanoutPayload>>,
) {
    // Heartbeat deadline: client must heartbeat within 1.5× the interval.
    let heartbeat_deadline = Duration::from_millis(state.config.heartbeat_interval_ms * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a frame.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame: ClientFrame = match serde_json::from_str(&text) {
                            Ok(f) => f,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };
                        if matches!(frame, ClientFrame::Heartbeat { .. }) {
                            got_heartbeat = true;
                        }

                        match handle_frame(state, session, frame) {
                            Ok(reply) => {
                                if send_frame(&mut ws_tx, &reply).await.is_err() {
                                    break;
                                }
                            }
                            Err((code, reason)) => {
                                let _ = send_close(&mut ws_tx, code, reason).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, session_id = %session.session_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Frame from the fan-out hub.
            result = broadcast_rx.recv() => {
                match result {
                    Ok(payload) => {
                        if !payload.is_for(&session.match_id, &session.session_id) {
                            continue;
                        }
                        if let ServerFrame::Broadcast { seq, .. } = &payload.frame {
                            // Already sent by a replay.
                            if *seq <= delivered {
                                continue;
                            }
                            delivered = *seq;
                        }
                        if send_frame(&mut ws_tx, &payload.frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            session_id = %session.session_id,
                            skipped = n,
                            "channel session lagged behind broadcast"
                        );
                        let (frames, caught_up) = catch_up(state, session, delivered);
                        delivered = caught_up;
                        for frame in &frames {
                            if send_frame(&mut ws_tx, frame).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // Heartbeat timeout check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        session_id = %session.session_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Frames that bring a socket up to date from `after_seq`: the buffered
/// broadcasts it has not seen (its own tracker's excluded), or
/// `resync_required` when the buffer no longer reaches back that far, then the
/// current presence set. Also returns the sequence number it is caught up to.
fn catch_up(state: &AppState, session: &ChannelSession, after_seq: u64) -> (Vec<ServerFrame>, u64) {
    let mut frames = Vec::new();
    let caught_up = match state.replay.replay_after(&session.match_id, after_seq) {
        Ok(entries) => {
            let caught_up = entries.last().map_or(after_seq, |entry| entry.seq);
            tracing::debug!(
                session_id = %session.session_id,
                after_seq,
                replayed = entries.len(),
                "replaying missed broadcasts"
            );
            frames.extend(
                entries
                    .into_iter()
                    .filter(|entry| entry.from != session.tracker_id)
                    .map(|entry| ServerFrame::Broadcast {
                        seq: entry.seq,
                        from: entry.from,
                        message: entry.message,
                    }),
            );
            caught_up
        }
        Err(gap) => {
            tracing::info!(
                session_id = %session.session_id,
                after_seq,
                latest = gap.latest,
                "resume point no longer buffered"
            );
            frames.push(ServerFrame::ResyncRequired { seq: gap.latest });
            gap.latest
        }
    };
    frames.push(presence_sync(state, session));
    (frames, caught_up)
}

fn presence_sync(state: &AppState, session: &ChannelSession) -> ServerFrame {
    ServerFrame::PresenceSync {
        presences: state.presence.list(&session.match_id),
    }
}

/// Apply one client frame. `Ok` carries the reply; `Err` closes the socket.
fn handle_frame(
    state: &AppState,
    session: &mut ChannelSession,
    frame: ClientFrame,
) -> Result<ServerFrame, (u16, &'static str)> {
    match frame {
        ClientFrame::Join { .. } => Err((CLOSE_ALREADY_JOINED, "Already joined")),
        ClientFrame::Heartbeat { reference } => Ok(ServerFrame::HeartbeatAck { reference }),
        ClientFrame::Publish { reference, message } => match publish(state, session, message) {
            Ok(()) => Ok(ServerFrame::Ack { reference }),
            Err(reason) => {
                tracing::debug!(session_id = %session.session_id, %reason, "publish rejected");
                Ok(ServerFrame::Rejected { reference, reason })
            }
        },
        ClientFrame::Track {
            reference,
            state: presence,
        } => {
            let first = session.mark_tracked();
            state.presence.track(
                &session.match_id,
                &session.tracker_id,
                presence.clone(),
                first,
            );
            state.fanout.dispatch(FanoutPayload {
                match_id: session.match_id.clone(),
                origin: Some(session.session_id.clone()),
                frame: ServerFrame::PresenceJoin {
                    tracker_id: session.tracker_id.clone(),
                    state: presence,
                },
            });
            Ok(ServerFrame::Ack { reference })
        }
        ClientFrame::Untrack { reference } => {
            if session.mark_untracked()
                && state
                    .presence
                    .untrack(&session.match_id, &session.tracker_id)
            {
                state.fanout.dispatch(FanoutPayload {
                    match_id: session.match_id.clone(),
                    origin: Some(session.session_id.clone()),
                    frame: ServerFrame::PresenceLeave {
                        tracker_id: session.tracker_id.clone(),
                    },
                });
            }
            Ok(ServerFrame::Ack { reference })
        }
    }
}

/// Sequence, buffer, and fan out a client's message, then the relay's
/// confirmation when enabled.
fn publish(state: &AppState, session: &ChannelSession, message: ChannelMessage) -> Result<(), String> {
    match &message {
        ChannelMessage::EventConfirmed(_) => {
            return Err("event_confirmed is sent by the relay only".to_string());
        }
        ChannelMessage::AddEvent(event) if event.match_id != session.match_id => {
            return Err(format!(
                "event {} belongs to match {}, not {}",
                event.id, event.match_id, session.match_id
            ));
        }
        _ => {}
    }

    let confirmation = match &message {
        ChannelMessage::AddEvent(event) if state.config.confirm_events => {
            Some(ChannelMessage::EventConfirmed(event.clone()))
        }
        _ => None,
    };

    let topic = message.topic();
    let seq = broadcast(
        state,
        &session.match_id,
        &session.tracker_id,
        Some(&session.session_id),
        message,
    );
    tracing::debug!(session_id = %session.session_id, seq, topic, "broadcast");

    if let Some(confirmation) = confirmation {
        broadcast(state, &session.match_id, RELAY_SENDER, None, confirmation);
    }
    Ok(())
}

fn broadcast(
    state: &AppState,
    match_id: &str,
    from: &str,
    origin: Option<&str>,
    message: ChannelMessage,
) -> u64 {
    state.replay.append(match_id, from, message, |entry| {
        state.fanout.dispatch(FanoutPayload {
            match_id: match_id.to_string(),
            origin: origin.map(str::to_string),
            frame: ServerFrame::Broadcast {
                seq: entry.seq,
                from: entry.from.clone(),
                message: entry.message.clone(),
            },
        });
    })
}

async fn send_frame(ws_tx: &mut WsSink, frame: &ServerFrame) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(?e, "failed to encode relay frame");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
