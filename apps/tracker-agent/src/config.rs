use pitchside_common::protocol::{AssignmentScope, EventType, TeamSide};
use pitchside_sync::{ClientRole, EngineConfig, SyncError};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:4010";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub match_id: String,
    pub tracker_id: String,
    pub relay_url: String,
    pub engine: EngineConfig,
    /// Trackers the coordinator may hand work to.
    pub pool: Vec<String>,
    /// Initial assignments seeded into the coordinator's store.
    pub assignments: Vec<(String, AssignmentScope)>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(EngineConfig::from_env(), |name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source on top of `engine`.
    pub fn from_lookup(
        mut engine: EngineConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SyncError> {
        let required = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SyncError::Config(format!("{name} must be set")))
        };
        let match_id = required("MATCH_ID")?;
        let tracker_id = required("TRACKER_ID")?;

        if let Some(role) = lookup("TRACKER_ROLE") {
            engine.role = ClientRole::parse(&role)
                .ok_or_else(|| SyncError::Config(format!("unknown TRACKER_ROLE `{role}`")))?;
        }

        let mut pool: Vec<String> = lookup("TRACKER_POOL")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let assignments = match lookup("ASSIGNMENTS") {
            Some(value) => parse_assignments(&value)?,
            None => Vec::new(),
        };
        for (tracker, _) in &assignments {
            if !pool.contains(tracker) {
                pool.push(tracker.clone());
            }
        }

        Ok(Self {
            match_id,
            tracker_id,
            relay_url: lookup("RELAY_URL").unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            engine,
            pool,
            assignments,
        })
    }
}

/// Parse `t1=home,t2=away:7,t3=events:goal|shot`.
pub fn parse_assignments(value: &str) -> Result<Vec<(String, AssignmentScope)>, SyncError> {
    value.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (tracker, scope) = entry
                .split_once('=')
                .ok_or_else(|| SyncError::Config(format!("assignment `{entry}` is missing `=`")))?;
            let tracker = tracker.trim();
            if tracker.is_empty() {
                return Err(SyncError::Config(format!("assignment `{entry}` has no tracker")));
            }
            Ok((tracker.to_string(), parse_scope(scope.trim())?))
        })
        .collect()
}

fn parse_scope(scope: &str) -> Result<AssignmentScope, SyncError> {
    let (head, rest) = match scope.split_once(':') {
        Some((head, rest)) => (head, Some(rest)),
        None => (scope, None),
    };

    if head.eq_ignore_ascii_case("events") {
        let event_types = rest
            .unwrap_or_default()
            .split('|')
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<EventType>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SyncError::Config(format!("scope `{scope}`: {e}")))?;
        if event_types.is_empty() {
            return Err(SyncError::Config(format!("scope `{scope}` lists no event types")));
        }
        return Ok(AssignmentScope::General { event_types });
    }

    let team_id: TeamSide = head
        .parse()
        .map_err(|e| SyncError::Config(format!("scope `{scope}`: {e}")))?;
    let player_id = rest
        .map(|p| {
            p.trim()
                .parse::<u32>()
                .map_err(|_| SyncError::Config(format!("scope `{scope}`: bad player number")))
        })
        .transpose()?;
    Ok(AssignmentScope::Player { team_id, player_id })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<AgentConfig, SyncError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::from_lookup(EngineConfig::default(), |name| vars.get(name).cloned())
    }

    #[test]
    fn identity_is_required() {
        let err = load(&[("TRACKER_ID", "t1")]).unwrap_err();
        assert!(matches!(err, SyncError::Config(ref m) if m.contains("MATCH_ID")));

        let err = load(&[("MATCH_ID", "m1"), ("TRACKER_ID", "  ")]).unwrap_err();
        assert!(matches!(err, SyncError::Config(ref m) if m.contains("TRACKER_ID")));
    }

    #[test]
    fn defaults_to_local_relay_as_tracker() {
        let config = load(&[("MATCH_ID", "m1"), ("TRACKER_ID", "t1")]).unwrap();
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(config.engine.role, ClientRole::Tracker);
        assert!(config.pool.is_empty());
        assert!(config.assignments.is_empty());
    }

    #[test]
    fn coordinator_pool_includes_assigned_trackers() {
        let config = load(&[
            ("MATCH_ID", "m1"),
            ("TRACKER_ID", "coord"),
            ("TRACKER_ROLE", "coordinator"),
            ("TRACKER_POOL", "t4, t5,"),
            ("ASSIGNMENTS", "t1=home,t4=away:7"),
        ])
        .unwrap();
        assert_eq!(config.engine.role, ClientRole::Coordinator);
        assert_eq!(config.pool, vec!["t4", "t5", "t1"]);
        assert_eq!(config.assignments.len(), 2);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = load(&[("MATCH_ID", "m1"), ("TRACKER_ID", "t1"), ("TRACKER_ROLE", "referee")])
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn parses_every_scope_form() {
        let parsed = parse_assignments("t1=home, t2=Away:7 ,t3=events:goal|free_kick").unwrap();
        assert_eq!(
            parsed,
            vec![
                (
                    "t1".to_string(),
                    AssignmentScope::Player { team_id: TeamSide::Home, player_id: None }
                ),
                (
                    "t2".to_string(),
                    AssignmentScope::Player { team_id: TeamSide::Away, player_id: Some(7) }
                ),
                (
                    "t3".to_string(),
                    AssignmentScope::General {
                        event_types: vec![EventType::Goal, EventType::FreeKick]
                    }
                ),
            ]
        );
    }

    #[test]
    fn malformed_assignments_are_config_errors() {
        for bad in ["t1", "=home", "t1=middle", "t1=home:seven", "t1=events:", "t1=events:yodel"] {
            assert!(
                matches!(parse_assignments(bad), Err(SyncError::Config(_))),
                "{bad} should fail"
            );
        }
    }
}
