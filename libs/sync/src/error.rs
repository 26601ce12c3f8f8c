//! Error types for the sync engine.
//!
//! Only `Config` is fatal. Everything else is recovered inside the engine
//! and surfaced as event status, queued work, or a standing warning.

/// Errors raised by a [`BroadcastChannel`](crate::channel::BroadcastChannel).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// No live connection; the caller should keep the work queued.
    #[error("channel not connected")]
    NotConnected,

    /// The transport received the frame and refused it.
    #[error("channel rejected message: {0}")]
    Rejected(String),

    #[error("timed out after {0} ms waiting for acknowledgement")]
    Timeout(u64),

    /// The channel was torn down and will not reconnect.
    #[error("channel closed")]
    Closed,

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl ChannelError {
    /// Whether the failure means "try again later" rather than "this send failed".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ChannelError::NotConnected)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ─────────────────────────────────────────────────────────────────────
    // Startup
    // ─────────────────────────────────────────────────────────────────────
    #[error("invalid configuration: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────
    #[error("broadcast channel unavailable")]
    ChannelUnavailable,

    #[error("send failed: {0}")]
    SendFailed(#[source] ChannelError),

    // ─────────────────────────────────────────────────────────────────────
    // Engine state
    // ─────────────────────────────────────────────────────────────────────
    #[error("no replacement available for tracker {0}")]
    NoReplacementAvailable(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("event {0} is not in a retryable state")]
    NotRetryable(String),

    // ─────────────────────────────────────────────────────────────────────
    // Collaborators
    // ─────────────────────────────────────────────────────────────────────
    #[error("assignment store error: {0}")]
    Store(String),

    #[error("persistence error: {0}")]
    Persist(String),
}

impl From<ChannelError> for SyncError {
    fn from(err: ChannelError) -> Self {
        if err.is_unavailable() {
            SyncError::ChannelUnavailable
        } else {
            SyncError::SendFailed(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
