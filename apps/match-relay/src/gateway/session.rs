//! Per-connection channel session state.

use pitchside_common::id::{prefix, prefixed_ulid};

/// State for a single joined WebSocket connection.
pub struct ChannelSession {
    /// Unique session identifier (`ses_` prefixed ULID).
    pub session_id: String,
    pub match_id: String,
    /// Tracker id given in the join frame.
    pub tracker_id: String,
    /// Whether this socket currently tracks presence.
    tracked: bool,
}

impl ChannelSession {
    pub fn new(match_id: String, tracker_id: String) -> Self {
        Self {
            session_id: prefixed_ulid(prefix::SESSION),
            match_id,
            tracker_id,
            tracked: false,
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    /// Record that the socket tracks presence. Returns `true` the first time.
    pub fn mark_tracked(&mut self) -> bool {
        !std::mem::replace(&mut self.tracked, true)
    }

    /// Record that the socket stopped tracking. Returns `true` if it was.
    pub fn mark_untracked(&mut self) -> bool {
        std::mem::replace(&mut self.tracked, false)
    }
}
