pub mod health;
pub mod matches;

use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(matches::router())
        .merge(crate::gateway::server::router())
}
