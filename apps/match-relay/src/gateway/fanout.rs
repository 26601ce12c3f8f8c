//! Broadcast hub for dispatching relay frames to connected channel sessions.
//!
//! A single `tokio::sync::broadcast` channel carries frames for every match.
//! Each session subscribes once and filters by match id and origin.

use std::sync::Arc;

use pitchside_common::protocol::ServerFrame;
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel. Slow receivers that fall behind
/// skip frames (RecvError::Lagged) and catch up from the replay log.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct FanoutPayload {
    pub match_id: String,
    /// Session that caused the frame; it is not sent back there.
    pub origin: Option<String>,
    pub frame: ServerFrame,
}

impl FanoutPayload {
    /// Whether the session `session_id` in `match_id` should receive this.
    pub fn is_for(&self, match_id: &str, session_id: &str) -> bool {
        self.match_id == match_id && self.origin.as_deref() != Some(session_id)
    }
}

/// The global fan-out hub. Cloneable; store it in AppState.
#[derive(Clone)]
pub struct MatchFanout {
    sender: broadcast::Sender<Arc<FanoutPayload>>,
}

impl MatchFanout {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<FanoutPayload>> {
        self.sender.subscribe()
    }

    pub fn dispatch(&self, payload: FanoutPayload) {
        // send() returns Err if there are no receivers; nobody is listening.
        let _ = self.sender.send(Arc::new(payload));
    }
}

impl Default for MatchFanout {
    fn default() -> Self {
        Self::new()
    }
}
