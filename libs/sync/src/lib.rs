//! Collaborative match-event sync with tracker failover.
//!
//! Every client in a match runs one [`MatchSession`]: an optimistic event
//! list reconciled over a shared broadcast channel, a presence table of the
//! other trackers, and (for the coordinator) absence detection with
//! automatic reassignment of an absent tracker's work.

pub mod absence;
pub mod assignment;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod notify;
pub mod persist;
pub mod presence;
pub mod session;

pub use config::{ClientRole, EngineConfig};
pub use error::{ChannelError, Result, SyncError};
pub use events::EventDraft;
pub use notify::EngineEvent;
pub use session::MatchSession;
