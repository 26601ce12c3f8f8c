use std::time::Duration;

use crate::gateway::fanout::DEFAULT_BROADCAST_CAPACITY;

/// Match relay configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Keepalive interval announced to clients in `joined`. A socket that
    /// sends no heartbeat within 1.5x this interval is closed.
    pub heartbeat_interval_ms: u64,
    /// How long a tracker with no live sockets stays in the presence set.
    pub presence_grace: Duration,
    /// Broadcast frames kept per match for resume.
    pub replay_buffer_size: usize,
    /// Answer every accepted `add_event` with an `event_confirmed`.
    pub confirm_events: bool,
    /// Frames a socket may fall behind the fan-out before it has to catch up
    /// from the replay log.
    pub broadcast_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4010,
            heartbeat_interval_ms: 25_000,
            presence_grace: Duration::from_secs(15),
            replay_buffer_size: 1000,
            confirm_events: true,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed_var("PORT").unwrap_or(defaults.port),
            heartbeat_interval_ms: parsed_var("HEARTBEAT_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .unwrap_or(defaults.heartbeat_interval_ms),
            presence_grace: parsed_var("PRESENCE_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.presence_grace),
            replay_buffer_size: parsed_var("REPLAY_BUFFER_SIZE")
                .filter(|size| *size > 0)
                .unwrap_or(defaults.replay_buffer_size),
            confirm_events: std::env::var("CONFIRM_EVENTS")
                .ok()
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.confirm_events),
            broadcast_capacity: parsed_var("BROADCAST_CAPACITY")
                .filter(|size| *size > 0)
                .unwrap_or(defaults.broadcast_capacity),
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(%name, value = %raw, "ignoring unparsable env var");
            None
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
