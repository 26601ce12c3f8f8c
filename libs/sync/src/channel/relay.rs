//! WebSocket client for the match relay.
//!
//! A supervisor task owns the socket. It joins the match (resuming from the
//! last sequence number it saw), forwards decoded frames to the inbound queue,
//! keeps the connection alive, and reconnects with exponential backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pitchside_common::protocol::{ChannelMessage, ClientFrame, PresenceState, ServerFrame};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use super::{BroadcastChannel, ChannelInbound, PresenceMember, Subscription};
use crate::config::EngineConfig;
use crate::error::ChannelError;

type Ack = oneshot::Sender<Result<(), ChannelError>>;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Base WebSocket URL, e.g. `ws://127.0.0.1:4010`.
    pub url: String,
    pub send_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl RelayOptions {
    pub fn new(url: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            url: url.into(),
            send_timeout: config.send_timeout,
            backoff_min: config.reconnect_backoff_min,
            backoff_max: config.reconnect_backoff_max,
        }
    }

    fn channel_url(&self, match_id: &str) -> String {
        format!("{}/matches/{}/channel", self.url.trim_end_matches('/'), match_id)
    }
}

struct Shared {
    connected: AtomicBool,
    closed: AtomicBool,
    next_ref: AtomicU64,
    /// Highest broadcast sequence number seen; 0 before the first join.
    last_seq: AtomicU64,
    pending: Mutex<HashMap<u64, Ack>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    /// Re-tracked after every reconnect.
    presence: Mutex<Option<Value>>,
    send_timeout: Duration,
}

impl Shared {
    fn next_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn resolve(&self, reference: u64, result: Result<(), ChannelError>) {
        if let Some(ack) = self.pending.lock().remove(&reference) {
            let _ = ack.send(result);
        }
    }

    fn fail_pending(&self, err: ChannelError) {
        for (_, ack) in self.pending.lock().drain() {
            let _ = ack.send(Err(err.clone()));
        }
    }
}

pub struct RelayChannel {
    match_id: String,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl RelayChannel {
    /// Start the supervisor and return immediately. The channel reports
    /// "not connected" until the first join completes.
    pub fn connect(options: RelayOptions, match_id: &str, tracker_id: &str) -> Subscription {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_ref: AtomicU64::new(0),
            last_seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(None),
            presence: Mutex::new(None),
            send_timeout: options.send_timeout,
        });

        tokio::spawn(supervise(
            options,
            match_id.to_string(),
            tracker_id.to_string(),
            shared.clone(),
            inbound_tx,
            shutdown_rx,
        ));

        let channel = RelayChannel {
            match_id: match_id.to_string(),
            shared,
            shutdown,
        };
        Subscription {
            channel: Arc::new(channel),
            inbound,
        }
    }

    /// Send a frame and wait for the relay to acknowledge its `ref`.
    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> Result<(), ChannelError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let tx = self
            .shared
            .outgoing
            .lock()
            .clone()
            .ok_or(ChannelError::NotConnected)?;

        let reference = self.shared.next_ref();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.pending.lock().insert(reference, ack_tx);

        if tx.send(build(reference)).is_err() {
            self.shared.pending.lock().remove(&reference);
            return Err(ChannelError::NotConnected);
        }

        match time::timeout(self.shared.send_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::NotConnected),
            Err(_) => {
                self.shared.pending.lock().remove(&reference);
                Err(ChannelError::Timeout(self.shared.send_timeout.as_millis() as u64))
            }
        }
    }
}

#[async_trait]
impl BroadcastChannel for RelayChannel {
    fn match_id(&self) -> &str {
        &self.match_id
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, message: &ChannelMessage) -> Result<(), ChannelError> {
        let message = message.clone();
        self.request(|reference| ClientFrame::Publish { reference, message })
            .await
    }

    async fn track(&self, state: &PresenceState) -> Result<(), ChannelError> {
        let value = state.to_value();
        *self.shared.presence.lock() = Some(value.clone());
        self.request(|reference| ClientFrame::Track {
            reference,
            state: value,
        })
        .await
    }

    async fn untrack(&self) -> Result<(), ChannelError> {
        *self.shared.presence.lock() = None;
        self.request(|reference| ClientFrame::Untrack { reference }).await
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

async fn supervise(
    options: RelayOptions,
    match_id: String,
    tracker_id: String,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<ChannelInbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = options.channel_url(&match_id);
    let mut backoff = options.backoff_min;

    loop {
        // A dropped handle counts as closed.
        if shared.closed.load(Ordering::SeqCst) || inbound.is_closed() || shutdown.has_changed().is_err() {
            break;
        }

        match run_connection(&url, &tracker_id, &shared, &inbound, &mut shutdown).await {
            Ok(()) => backoff = options.backoff_min,
            Err(reason) => {
                tracing::warn!(%match_id, %reason, retry_in_ms = backoff.as_millis() as u64, "relay connection failed");
            }
        }

        *shared.outgoing.lock() = None;
        shared.fail_pending(ChannelError::NotConnected);
        if shared.connected.swap(false, Ordering::SeqCst) {
            let _ = inbound.send(ChannelInbound::Disconnected);
            tracing::info!(%match_id, "relay connection lost");
        }

        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = time::sleep(backoff) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        backoff = (backoff * 2).min(options.backoff_max);
    }

    shared.fail_pending(ChannelError::Closed);
    tracing::debug!(%match_id, "relay supervisor stopped");
}

/// One socket lifetime. `Ok` once the join succeeded, however the socket
/// ended afterwards.
async fn run_connection(
    url: &str,
    tracker_id: &str,
    shared: &Shared,
    inbound: &mpsc::UnboundedSender<ChannelInbound>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), String> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| format!("connect: {e}"))?;
    let (mut write, mut read) = ws.split();

    let since_seq = match shared.last_seq.load(Ordering::SeqCst) {
        0 => None,
        seq => Some(seq),
    };
    let join = ClientFrame::Join {
        tracker_id: tracker_id.to_string(),
        since_seq,
    };
    write
        .send(encode(&join)?)
        .await
        .map_err(|e| format!("send join: {e}"))?;

    let heartbeat_interval_ms = time::timeout(shared.send_timeout, async {
        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| format!("read: {e}"))?;
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => return Err("closed during join".to_string()),
                _ => continue,
            };
            match serde_json::from_str::<ServerFrame>(text.as_str()) {
                Ok(ServerFrame::Joined {
                    seq,
                    heartbeat_interval_ms,
                    session_id,
                    ..
                }) => {
                    if since_seq.is_none() {
                        shared.last_seq.store(seq, Ordering::SeqCst);
                    }
                    tracing::info!(%session_id, seq, "joined match channel");
                    return Ok(heartbeat_interval_ms);
                }
                Ok(ServerFrame::Error { reason }) => return Err(reason),
                Ok(other) => tracing::debug!(?other, "frame before join acknowledgement"),
                Err(e) => return Err(format!("invalid frame: {e}")),
            }
        }
        Err::<u64, String>("connection closed before join".to_string())
    })
    .await
    .map_err(|_| "join timed out".to_string())??;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
    *shared.outgoing.lock() = Some(out_tx.clone());
    shared.connected.store(true, Ordering::SeqCst);
    let _ = inbound.send(ChannelInbound::Connected);

    if let Some(state) = shared.presence.lock().clone() {
        let _ = out_tx.send(ClientFrame::Track {
            reference: shared.next_ref(),
            state,
        });
    }

    let mut keepalive = time::interval(Duration::from_millis(heartbeat_interval_ms.max(1)));
    keepalive.tick().await;

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let msg = match encode(&frame) {
                    Ok(msg) => msg,
                    Err(reason) => {
                        if let Some(reference) = frame_ref(&frame) {
                            shared.resolve(reference, Err(ChannelError::Encode(reason)));
                        }
                        continue;
                    }
                };
                if write.send(msg).await.is_err() {
                    break;
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(frame) => handle_frame(frame, shared, inbound),
                            Err(e) => tracing::warn!(error = %e, "undecodable relay frame"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "relay closed connection");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "relay read error");
                        break;
                    }
                    None => break,
                }
            }

            _ = keepalive.tick() => {
                let beat = ClientFrame::Heartbeat { reference: shared.next_ref() };
                if let Ok(msg) = encode(&beat) {
                    if write.send(msg).await.is_err() {
                        break;
                    }
                }
            }

            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }

    Ok(())
}

fn handle_frame(frame: ServerFrame, shared: &Shared, inbound: &mpsc::UnboundedSender<ChannelInbound>) {
    match frame {
        ServerFrame::Broadcast { seq, from, message } => {
            // Replay after a resume can overlap what we already have.
            if seq <= shared.last_seq.load(Ordering::SeqCst) {
                return;
            }
            shared.last_seq.store(seq, Ordering::SeqCst);
            let _ = inbound.send(ChannelInbound::Message { from, message });
        }
        ServerFrame::Ack { reference } => shared.resolve(reference, Ok(())),
        ServerFrame::Rejected { reference, reason } => {
            shared.resolve(reference, Err(ChannelError::Rejected(reason)))
        }
        ServerFrame::PresenceSync { presences } => {
            let members = presences.into_iter().map(PresenceMember::from).collect();
            let _ = inbound.send(ChannelInbound::PresenceSync(members));
        }
        ServerFrame::PresenceJoin { tracker_id, state } => {
            let member = PresenceMember {
                state: PresenceState::from_value(&state),
                tracker_id,
            };
            let _ = inbound.send(ChannelInbound::PresenceJoin(member));
        }
        ServerFrame::PresenceLeave { tracker_id } => {
            let _ = inbound.send(ChannelInbound::PresenceLeave { tracker_id });
        }
        ServerFrame::ResyncRequired { seq } => {
            shared.last_seq.store(seq, Ordering::SeqCst);
            let _ = inbound.send(ChannelInbound::ResyncRequired);
        }
        ServerFrame::HeartbeatAck { .. } => {}
        ServerFrame::Error { reason } => tracing::warn!(%reason, "relay reported an error"),
        ServerFrame::Joined { .. } => tracing::debug!("duplicate join acknowledgement"),
    }
}

fn encode(frame: &ClientFrame) -> Result<Message, String> {
    serde_json::to_string(frame)
        .map(|json| Message::Text(json.into()))
        .map_err(|e| e.to_string())
}

fn frame_ref(frame: &ClientFrame) -> Option<u64> {
    match frame {
        ClientFrame::Publish { reference, .. }
        | ClientFrame::Track { reference, .. }
        | ClientFrame::Untrack { reference }
        | ClientFrame::Heartbeat { reference } => Some(*reference),
        ClientFrame::Join { .. } => None,
    }
}
