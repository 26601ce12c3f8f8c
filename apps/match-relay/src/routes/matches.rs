use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use pitchside_common::protocol::PresenceEntry;
use serde::Serialize;

use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/matches", get(list_matches))
        .route("/matches/{match_id}/presence", get(match_presence))
}

#[derive(Debug, Serialize)]
pub struct MatchSummary {
    pub match_id: String,
    /// Latest broadcast sequence number.
    pub seq: u64,
    /// Trackers currently present.
    pub present: usize,
}

#[derive(Debug, Serialize)]
pub struct MatchPresence {
    pub match_id: String,
    pub presences: Vec<PresenceEntry>,
}

async fn list_matches(State(state): State<AppState>) -> Json<Vec<MatchSummary>> {
    let mut summaries: BTreeMap<String, MatchSummary> = BTreeMap::new();
    for (match_id, seq) in state.replay.matches() {
        summaries.insert(
            match_id.clone(),
            MatchSummary {
                match_id,
                seq,
                present: 0,
            },
        );
    }
    for (match_id, present) in state.presence.counts() {
        summaries
            .entry(match_id.clone())
            .or_insert_with(|| MatchSummary {
                match_id,
                seq: 0,
                present: 0,
            })
            .present = present;
    }
    Json(summaries.into_values().collect())
}

async fn match_presence(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<Json<MatchPresence>, ApiError> {
    let presences = state.presence.list(&match_id);
    if presences.is_empty() && state.replay.latest_seq(&match_id) == 0 {
        return Err(ApiError::not_found(format!("No activity in match {match_id}")));
    }
    Ok(Json(MatchPresence {
        match_id,
        presences,
    }))
}
