use std::time::Duration;

/// What a client does for its match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// Records events and emits heartbeats.
    Tracker,
    /// Additionally runs absence detection and replacement assignment.
    /// One coordinator per match.
    Coordinator,
}

impl ClientRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tracker" => Some(ClientRole::Tracker),
            "coordinator" | "admin" => Some(ClientRole::Coordinator),
            _ => None,
        }
    }
}

/// Timing and threshold knobs for one match engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub role: ClientRole,
    /// How often the heartbeat task emits the tracker's status.
    pub heartbeat_interval: Duration,
    /// Minimum spacing between two status broadcasts. Changes inside the
    /// window are coalesced into the latest one.
    pub status_throttle: Duration,
    /// Period of the absence scan.
    pub scan_interval: Duration,
    /// A tracker with no activity for longer than this is absent.
    pub inactivity_threshold: Duration,
    /// A tracker with at least this many consecutive misses is absent.
    pub max_missed_heartbeats: u32,
    /// How long to wait for the transport to acknowledge a publish.
    pub send_timeout: Duration,
    /// Fallback period of the outbound drain when no wake-up arrives.
    pub drain_interval: Duration,
    pub reconnect_backoff_min: Duration,
    pub reconnect_backoff_max: Duration,
    /// Capacity of the engine notification channel.
    pub notification_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            role: ClientRole::Tracker,
            heartbeat_interval: Duration::from_secs(5),
            status_throttle: Duration::from_secs(5),
            scan_interval: Duration::from_secs(30),
            inactivity_threshold: Duration::from_secs(180),
            max_missed_heartbeats: 3,
            send_timeout: Duration::from_secs(5),
            drain_interval: Duration::from_secs(2),
            reconnect_backoff_min: Duration::from_millis(500),
            reconnect_backoff_max: Duration::from_secs(10),
            notification_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `PITCHSIDE_*` environment variables.
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            role: std::env::var("PITCHSIDE_ROLE")
                .ok()
                .and_then(|v| ClientRole::parse(&v))
                .unwrap_or(defaults.role),
            heartbeat_interval: millis_var("PITCHSIDE_HEARTBEAT_MS", defaults.heartbeat_interval),
            status_throttle: millis_var("PITCHSIDE_STATUS_THROTTLE_MS", defaults.status_throttle),
            scan_interval: millis_var("PITCHSIDE_SCAN_MS", defaults.scan_interval),
            inactivity_threshold: millis_var(
                "PITCHSIDE_INACTIVITY_MS",
                defaults.inactivity_threshold,
            ),
            max_missed_heartbeats: std::env::var("PITCHSIDE_MAX_MISSED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_missed_heartbeats),
            send_timeout: millis_var("PITCHSIDE_SEND_TIMEOUT_MS", defaults.send_timeout),
            drain_interval: millis_var("PITCHSIDE_DRAIN_MS", defaults.drain_interval),
            ..defaults
        }
    }

    pub fn coordinator() -> Self {
        Self {
            role: ClientRole::Coordinator,
            ..Self::default()
        }
    }
}

fn millis_var(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_cadence() {
        let config = EngineConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.scan_interval, Duration::from_secs(30));
        assert_eq!(config.inactivity_threshold, Duration::from_secs(180));
        assert_eq!(config.max_missed_heartbeats, 3);
        assert_eq!(config.role, ClientRole::Tracker);
    }

    #[test]
    fn role_parse_accepts_admin_alias() {
        assert_eq!(ClientRole::parse("Coordinator"), Some(ClientRole::Coordinator));
        assert_eq!(ClientRole::parse("admin"), Some(ClientRole::Coordinator));
        assert_eq!(ClientRole::parse("tracker"), Some(ClientRole::Tracker));
        assert_eq!(ClientRole::parse("referee"), None);
    }
}
