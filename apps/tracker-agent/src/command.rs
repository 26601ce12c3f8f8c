//! Operator commands read line by line from stdin.

use std::str::FromStr;

use pitchside_common::protocol::{HeartbeatMetrics, NetworkQuality, TrackerStatus};
use pitchside_sync::EventDraft;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `<event-type> <home|away> [player] [x y]`
    Record(EventDraft),
    /// `status <active|recording|inactive> [action...]`
    Status {
        status: TrackerStatus,
        action: Option<String>,
    },
    /// `metrics <battery> [excellent|good|poor]`
    Metrics(HeartbeatMetrics),
    /// `kickoff`: match clock starts now.
    Kickoff,
    /// `retry [event-id]`
    Retry(Option<String>),
    Events,
    Presence,
    Absences,
    Assignments,
    Reassign(String),
    Dismiss(String),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid {field}: `{value}`")]
    Invalid { field: &'static str, value: String },
}

pub const HELP: &str = "\
commands:
  <event-type> <home|away> [player] [x y]   record an event (e.g. `goal home 9 0.8 0.4`)
  status <active|recording|inactive> [action]
  metrics <battery 0-100> [excellent|good|poor]
  kickoff                                   start the match clock now
  retry [event-id]                          resend failed events
  events | presence | absences | assignments
  reassign <tracker-id>                     coordinator: hand work to a replacement
  dismiss <tracker-id>                      coordinator: drop a standing warning
  quit";

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let head = words.next().ok_or(CommandError::Empty)?.to_ascii_lowercase();
        let args: Vec<&str> = words.collect();

        let command = match head.as_str() {
            "status" => {
                let status = args.first().ok_or(CommandError::Usage(
                    "status <active|recording|inactive> [action]",
                ))?;
                let action = (args.len() > 1).then(|| args[1..].join(" "));
                Command::Status {
                    status: lowercase_variant("status", status)?,
                    action,
                }
            }
            "metrics" => {
                let battery = args
                    .first()
                    .ok_or(CommandError::Usage("metrics <battery> [network]"))?;
                let battery_level = battery
                    .parse::<u8>()
                    .ok()
                    .filter(|b| *b <= 100)
                    .ok_or_else(|| invalid("battery level", battery))?;
                let network_quality = args
                    .get(1)
                    .map(|q| lowercase_variant::<NetworkQuality>("network quality", q))
                    .transpose()?;
                Command::Metrics(HeartbeatMetrics {
                    battery_level: Some(battery_level),
                    network_quality,
                })
            }
            "kickoff" => Command::Kickoff,
            "retry" => Command::Retry(args.first().map(|id| id.to_string())),
            "events" => Command::Events,
            "presence" => Command::Presence,
            "absences" => Command::Absences,
            "assignments" => Command::Assignments,
            "reassign" => Command::Reassign(single(&args, "reassign <tracker-id>")?),
            "dismiss" => Command::Dismiss(single(&args, "dismiss <tracker-id>")?),
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => match other.parse() {
                Ok(event_type) => Command::Record(record(event_type, &args)?),
                Err(_) => return Err(CommandError::Unknown(other.to_string())),
            },
        };
        Ok(command)
    }
}

fn record(
    event_type: pitchside_common::protocol::EventType,
    args: &[&str],
) -> Result<EventDraft, CommandError> {
    const USAGE: &str = "<event-type> <home|away> [player] [x y]";
    let team = args.first().ok_or(CommandError::Usage(USAGE))?;
    let team_id = team.parse().map_err(|_| invalid("team", team))?;
    let mut draft = EventDraft::new(event_type, team_id);

    let rest = &args[1..];
    let coords = match rest.len() {
        0 => None,
        1 => {
            draft = draft.player(player(rest[0])?);
            None
        }
        2 => Some((rest[0], rest[1])),
        3 => {
            draft = draft.player(player(rest[0])?);
            Some((rest[1], rest[2]))
        }
        _ => return Err(CommandError::Usage(USAGE)),
    };
    if let Some((x, y)) = coords {
        draft = draft.at(coordinate(x)?, coordinate(y)?);
    }
    Ok(draft)
}

fn player(value: &str) -> Result<u32, CommandError> {
    value.parse().map_err(|_| invalid("player number", value))
}

fn coordinate(value: &str) -> Result<f64, CommandError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| invalid("coordinate", value))
}

fn single(args: &[&str], usage: &'static str) -> Result<String, CommandError> {
    match args {
        [one] => Ok(one.to_string()),
        _ => Err(CommandError::Usage(usage)),
    }
}

/// Parse a lowercase wire enum through its serde representation.
fn lowercase_variant<T: serde::de::DeserializeOwned>(
    field: &'static str,
    value: &str,
) -> Result<T, CommandError> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| invalid(field, value))
}

fn invalid(field: &'static str, value: &str) -> CommandError {
    CommandError::Invalid {
        field,
        value: value.to_string(),
    }
}
