//! Match channel wire format: message topics, tracked events, and the
//! client/relay frames that carry them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Tracked events
// ---------------------------------------------------------------------------

/// Kinds of match action a tracker can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Shot,
    Goal,
    Foul,
    Pass,
    Card,
    Offside,
    Corner,
    Penalty,
    FreeKick,
    GoalKick,
    ThrowIn,
    Tackle,
    Interception,
    Dribble,
    Cross,
    Header,
}

impl EventType {
    pub const ALL: [EventType; 16] = [
        EventType::Shot,
        EventType::Goal,
        EventType::Foul,
        EventType::Pass,
        EventType::Card,
        EventType::Offside,
        EventType::Corner,
        EventType::Penalty,
        EventType::FreeKick,
        EventType::GoalKick,
        EventType::ThrowIn,
        EventType::Tackle,
        EventType::Interception,
        EventType::Dribble,
        EventType::Cross,
        EventType::Header,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Shot => "shot",
            EventType::Goal => "goal",
            EventType::Foul => "foul",
            EventType::Pass => "pass",
            EventType::Card => "card",
            EventType::Offside => "offside",
            EventType::Corner => "corner",
            EventType::Penalty => "penalty",
            EventType::FreeKick => "free-kick",
            EventType::GoalKick => "goal-kick",
            EventType::ThrowIn => "throw-in",
            EventType::Tackle => "tackle",
            EventType::Interception => "interception",
            EventType::Dribble => "dribble",
            EventType::Cross => "cross",
            EventType::Header => "header",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant `{}`", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for EventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        EventType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamSide {
    Home,
    Away,
}

impl FromStr for TeamSide {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "home" => Ok(TeamSide::Home),
            "away" => Ok(TeamSide::Away),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// Position on the pitch diagram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Optimistic,
    PendingConfirmation,
    Confirmed,
    Failed,
}

/// One recorded match action.
///
/// `id` is minted once by the originating client and is the only key used to
/// deduplicate optimistic, echoed, and confirmed copies of the same action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub id: String,
    pub match_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub team_id: TeamSide,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<u32>,
    /// Match time, not wall-clock.
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    pub created_by: String,
    pub status: EventStatus,
}

// ---------------------------------------------------------------------------
// Tracker status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerStatus {
    Active,
    Recording,
    Inactive,
}

impl TrackerStatus {
    /// Active and recording both count as a live heartbeat.
    pub fn is_live(&self) -> bool {
        matches!(self, TrackerStatus::Active | TrackerStatus::Recording)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Poor,
}

/// Optional device metrics attached to a heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_quality: Option<NetworkQuality>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    #[default]
    TrackerStatus,
}

/// Payload of the `tracker_update` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerStatusUpdate {
    #[serde(rename = "type", default)]
    pub kind: UpdateKind,
    pub tracker_id: String,
    pub status: TrackerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Wall-clock ms when the status was produced.
    pub timestamp: i64,
    #[serde(flatten)]
    pub metrics: HeartbeatMetrics,
}

/// Payload of the `event_tracked` topic: "tracker X just recorded Y".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTracked {
    pub tracker_id: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

/// What a tracker is responsible for in a match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssignmentScope {
    /// Player-specific work; `player_id = None` covers the whole team.
    Player {
        team_id: TeamSide,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_id: Option<u32>,
    },
    General { event_types: Vec<EventType> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub match_id: String,
    pub tracker_id: String,
    pub scope: AssignmentScope,
    pub active: bool,
    /// Assignment this one took over from, when created by a reassignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
}

/// Payload of the `tracker_reassigned` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerReassigned {
    pub absent_tracker_id: String,
    pub replacement_tracker_id: String,
    pub assignments: Vec<Assignment>,
    pub reason: String,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Channel messages
// ---------------------------------------------------------------------------

/// Every message that travels over a match channel, decoded once at the
/// channel boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload", rename_all = "snake_case")]
pub enum ChannelMessage {
    AddEvent(TrackedEvent),
    EventConfirmed(TrackedEvent),
    TrackerUpdate(TrackerStatusUpdate),
    EventTracked(EventTracked),
    TrackerReassigned(TrackerReassigned),
}

impl ChannelMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            ChannelMessage::AddEvent(_) => "add_event",
            ChannelMessage::EventConfirmed(_) => "event_confirmed",
            ChannelMessage::TrackerUpdate(_) => "tracker_update",
            ChannelMessage::EventTracked(_) => "event_tracked",
            ChannelMessage::TrackerReassigned(_) => "tracker_reassigned",
        }
    }
}

/// The presence blob a client tracks on the channel. The relay stores it
/// opaquely; clients decode it with [`PresenceState::from_value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub tracker_id: String,
    pub status: TrackerStatus,
    pub online_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_type: Option<EventType>,
}

impl PresenceState {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One subscriber in a presence sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub tracker_id: String,
    pub state: Value,
}

// ---------------------------------------------------------------------------
// Client → relay frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection. `since_seq` resumes from the match's
    /// replay buffer.
    Join {
        tracker_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_seq: Option<u64>,
    },
    Publish {
        #[serde(rename = "ref")]
        reference: u64,
        message: ChannelMessage,
    },
    Track {
        #[serde(rename = "ref")]
        reference: u64,
        state: Value,
    },
    Untrack {
        #[serde(rename = "ref")]
        reference: u64,
    },
    Heartbeat {
        #[serde(rename = "ref")]
        reference: u64,
    },
}

// ---------------------------------------------------------------------------
// Relay → client frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Joined {
        session_id: String,
        match_id: String,
        /// Latest sequence number in the match's broadcast log.
        seq: u64,
        heartbeat_interval_ms: u64,
    },
    Broadcast {
        seq: u64,
        from: String,
        message: ChannelMessage,
    },
    Ack {
        #[serde(rename = "ref")]
        reference: u64,
    },
    Rejected {
        #[serde(rename = "ref")]
        reference: u64,
        reason: String,
    },
    PresenceSync {
        presences: Vec<PresenceEntry>,
    },
    PresenceJoin {
        tracker_id: String,
        state: Value,
    },
    PresenceLeave {
        tracker_id: String,
    },
    HeartbeatAck {
        #[serde(rename = "ref")]
        reference: u64,
    },
    /// The requested `since_seq` fell out of the replay buffer.
    ResyncRequired {
        seq: u64,
    },
    Error {
        reason: String,
    },
}

/// Sender name the relay uses for messages it originates (confirmations).
pub const RELAY_SENDER: &str = "relay";
