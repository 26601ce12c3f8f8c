use std::path::Path;
use std::sync::Arc;

use pitchside_common::clock::now_ms;
use pitchside_sync::assignment::{AssignmentStore, MemoryAssignmentStore};
use pitchside_sync::channel::relay::{RelayChannel, RelayOptions};
use pitchside_sync::notify::{Notice, Recipient};
use pitchside_sync::persist::NoopPersistence;
use pitchside_sync::{ClientRole, EngineEvent, MatchSession};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tracker_agent::command::{Command, CommandError, HELP};
use tracker_agent::config::AgentConfig;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "tracker-agent cannot start");
            std::process::exit(1);
        }
    };

    tracing::info!(
        match_id = %config.match_id,
        tracker_id = %config.tracker_id,
        relay_url = %config.relay_url,
        role = ?config.engine.role,
        "tracker-agent configured"
    );

    let store: Option<Arc<dyn AssignmentStore>> = match config.engine.role {
        ClientRole::Coordinator => {
            let store = MemoryAssignmentStore::with_pool(config.pool.clone());
            for (tracker_id, scope) in &config.assignments {
                store.assign(&config.match_id, tracker_id, scope.clone());
            }
            Some(Arc::new(store))
        }
        ClientRole::Tracker => None,
    };

    let subscription = RelayChannel::connect(
        RelayOptions::new(config.relay_url.clone(), &config.engine),
        &config.match_id,
        &config.tracker_id,
    );
    let session = match MatchSession::start(
        config.engine.clone(),
        &config.match_id,
        &config.tracker_id,
        subscription,
        store,
        Arc::new(NoopPersistence),
    ) {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(%err, "failed to start match session");
            std::process::exit(1);
        }
    };

    let printer = tokio::spawn(print_events(
        session.subscribe(),
        config.tracker_id.clone(),
        config.engine.role,
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match line.parse::<Command>() {
                        Ok(Command::Quit) => break,
                        Ok(command) => run(&session, command).await,
                        Err(CommandError::Empty) => {}
                        Err(err) => eprintln!("{err}"),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(%err, "stdin read failed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    session.shutdown().await;
    printer.abort();
}

async fn run(session: &MatchSession, command: Command) {
    match command {
        Command::Record(draft) => {
            let event = session.record_event(draft);
            println!("recorded {} {:?} ({})", event.event_type, event.team_id, event.id);
        }
        Command::Status { status, action } => session.set_status(status, action),
        Command::Metrics(metrics) => session.set_metrics(metrics),
        Command::Kickoff => session.set_kickoff(now_ms()),
        Command::Retry(Some(id)) => match session.retry_event(&id) {
            Ok(event) => println!("retrying {}", event.id),
            Err(err) => eprintln!("{err}"),
        },
        Command::Retry(None) => {
            let retried = session.retry_failed();
            println!("retrying {} event(s)", retried.len());
        }
        Command::Events => print_json(&session.events()),
        Command::Presence => print_json(&session.presence_snapshot()),
        Command::Absences => {
            print_json(&session.active_absences());
            let warnings = session.warnings();
            if !warnings.is_empty() {
                println!("standing warnings:");
                print_json(&warnings);
            }
        }
        Command::Assignments => print_json(&session.assignments()),
        Command::Reassign(tracker_id) => match session.reassign(&tracker_id).await {
            Ok(assignments) => println!(
                "moved {} assignment(s) away from {tracker_id}",
                assignments.len()
            ),
            Err(err) => eprintln!("{err}"),
        },
        Command::Dismiss(tracker_id) => {
            if !session.dismiss_warning(&tracker_id) {
                eprintln!("no standing warning for {tracker_id}");
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}

/// Log engine notifications; print notices addressed to this client.
async fn print_events(
    mut events: broadcast::Receiver<EngineEvent>,
    tracker_id: String,
    role: ClientRole,
) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::Notice(Notice {
                recipient,
                level,
                message,
            })) => {
                let mine = match recipient {
                    Recipient::Everyone => true,
                    Recipient::Tracker(id) => id == tracker_id,
                    Recipient::Coordinators => role == ClientRole::Coordinator,
                };
                if mine {
                    println!("[{level:?}] {message}");
                }
            }
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(target: "tracker_agent::events", "{json}"),
                Err(err) => tracing::warn!(%err, "failed to encode engine event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "notification stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("failed to encode output: {err}"),
    }
}
