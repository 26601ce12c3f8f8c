//! The per-match broadcast channel seam.
//!
//! Adapters decode transport frames once, at this boundary, into
//! [`ChannelInbound`] values delivered on an unbounded queue.

pub mod memory;
pub mod relay;

use std::sync::Arc;

use async_trait::async_trait;
use pitchside_common::protocol::{ChannelMessage, PresenceEntry, PresenceState};
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// One subscriber as seen in a presence notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMember {
    pub tracker_id: String,
    /// `None` when the tracked blob did not decode.
    pub state: Option<PresenceState>,
}

impl From<PresenceEntry> for PresenceMember {
    fn from(entry: PresenceEntry) -> Self {
        Self {
            state: PresenceState::from_value(&entry.state),
            tracker_id: entry.tracker_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelInbound {
    Connected,
    Disconnected,
    Message { from: String, message: ChannelMessage },
    /// Full presence set. Sent on every (re)subscribe.
    PresenceSync(Vec<PresenceMember>),
    PresenceJoin(PresenceMember),
    PresenceLeave { tracker_id: String },
    /// Messages were lost while disconnected and cannot be replayed.
    ResyncRequired,
}

#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    fn match_id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Send to every other subscriber. Resolves once the transport accepted it.
    async fn publish(&self, message: &ChannelMessage) -> Result<(), ChannelError>;

    async fn track(&self, state: &PresenceState) -> Result<(), ChannelError>;

    async fn untrack(&self) -> Result<(), ChannelError>;

    /// Leave the match. The inbound queue ends afterwards.
    async fn close(&self);
}

/// A live subscription: the handle for outbound calls plus the inbound queue.
pub struct Subscription {
    pub channel: Arc<dyn BroadcastChannel>,
    pub inbound: mpsc::UnboundedReceiver<ChannelInbound>,
}
