pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use config::Config;
use gateway::fanout::MatchFanout;
use gateway::presence::PresenceRegistry;
use gateway::replay::ReplayLog;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub fanout: Arc<MatchFanout>,
    pub replay: Arc<ReplayLog>,
    pub presence: Arc<PresenceRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            replay: Arc::new(ReplayLog::new(config.replay_buffer_size)),
            fanout: Arc::new(MatchFanout::with_capacity(config.broadcast_capacity)),
            presence: Arc::new(PresenceRegistry::new()),
            config: Arc::new(config),
        }
    }
}
