pub mod fanout;
pub mod presence;
pub mod replay;
pub mod server;
pub mod session;

use std::time::Duration;

use pitchside_common::protocol::ServerFrame;
use tokio::task::JoinHandle;
use tokio::time;

use crate::AppState;
use fanout::FanoutPayload;

/// Periodically announce trackers whose presence grace period expired, then
/// drop the replay logs of matches nobody is connected to anymore.
pub fn spawn_presence_sweeper(state: AppState) -> JoinHandle<()> {
    let grace = state.config.presence_grace;
    let period = (grace / 2).clamp(Duration::from_millis(50), Duration::from_secs(5));

    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        loop {
            ticker.tick().await;
            for gone in state.presence.sweep(grace) {
                tracing::info!(
                    match_id = %gone.match_id,
                    tracker_id = %gone.tracker_id,
                    "presence grace period expired"
                );
                state.fanout.dispatch(FanoutPayload {
                    match_id: gone.match_id,
                    origin: None,
                    frame: ServerFrame::PresenceLeave {
                        tracker_id: gone.tracker_id,
                    },
                });
            }

            let present = state.presence.counts();
            for match_id in state.replay.evict_idle(|match_id| present.contains_key(match_id)) {
                tracing::info!(%match_id, "replay log dropped");
            }
        }
    })
}
