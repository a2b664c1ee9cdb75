//! Playtime daemon entrypoint.
//!
//! A single-writer service that owns the timer store, evaluates countdowns on
//! a fixed cadence, and pushes snapshots and alerts to connected displays over
//! WebSocket. Sales and extension flows reach it through a small HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod alert;
mod api;
mod config;
mod connections;
mod crash_ledger;
mod error;
mod evaluator;
mod logging;
mod state;
mod store;
mod timer;
mod ws;

use connections::ConnectionManager;
use evaluator::{EvaluatorStats, TimerEvaluator};
use state::AppState;
use store::{SqliteTimerStore, TimerStore};

const EVALUATOR_STOP_TIMEOUT_SECS: u64 = 5;

#[tokio::main]
async fn main() {
    let (config, config_error) = config::load_config(None);
    let _log_guard = logging::init(config.logging.dir.as_deref());
    if let Some(err) = config_error {
        warn!(error = %err, "Falling back to default daemon config");
    }

    let ledger_path = match config::crash_ledger_path() {
        Ok(path) => {
            crash_ledger::hold_off(&path).await;
            Some(path)
        }
        Err(err) => {
            warn!(error = %err, "Failed to resolve crash ledger path");
            None
        }
    };

    let store_path = match config::store_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve timer store path");
            crash_ledger::fatal(ledger_path.as_ref(), "timer store path unresolved");
        }
    };
    let store: Arc<dyn TimerStore> = match SqliteTimerStore::new(store_path.clone()) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, path = %store_path.display(), "Failed to open timer store");
            crash_ledger::fatal(ledger_path.as_ref(), "timer store unavailable");
        }
    };

    let listener = match TcpListener::bind(&config.server.bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, bind = %config.server.bind, "Failed to bind daemon listener");
            crash_ledger::fatal(ledger_path.as_ref(), "listener bind failed");
        }
    };

    let shutdown = CancellationToken::new();
    let connections = Arc::new(ConnectionManager::new(config.broadcast.send_timeout()));
    let stats = Arc::new(EvaluatorStats::default());

    let evaluator_token = shutdown.child_token();
    let mut evaluator = TimerEvaluator::new(
        Arc::clone(&store),
        Arc::clone(&connections),
        Arc::clone(&stats),
        config.evaluator.interval(),
        config.evaluator.expired_grace(),
    )
    .spawn(evaluator_token.clone());

    spawn_pinger(
        Arc::clone(&connections),
        Duration::from_secs(config.server.ping_interval_secs.max(1)),
        shutdown.child_token(),
    );
    spawn_signal_listener(shutdown.clone());

    let state = Arc::new(AppState {
        store,
        connections,
        stats,
        config: config.clone(),
        shutdown: shutdown.clone(),
    });
    let app = api::router(state);

    info!(
        bind = %config.server.bind,
        store = %store_path.display(),
        interval_secs = config.evaluator.interval_secs,
        "Playtime daemon started"
    );

    let server_token = shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { server_token.cancelled().await });

    let mut crash_reason = None;
    tokio::select! {
        result = server => {
            if let Err(err) = result {
                error!(error = %err, "HTTP server failed");
                crash_reason = Some("http server failed");
            }
        }
        result = &mut evaluator => {
            // Only a cancel may end the evaluator; anything else is a crash.
            if !evaluator_token.is_cancelled() {
                match result {
                    Ok(()) => error!("Timer evaluator exited unexpectedly"),
                    Err(err) => error!(error = %err, "Timer evaluator failed"),
                }
                crash_reason = Some("timer evaluator exited");
            }
        }
    }

    shutdown.cancel();
    if !evaluator.is_finished() {
        let stop = Duration::from_secs(EVALUATOR_STOP_TIMEOUT_SECS);
        if tokio::time::timeout(stop, &mut evaluator).await.is_err() {
            warn!("Timer evaluator did not stop in time");
        }
    }

    if let Some(reason) = crash_reason {
        crash_ledger::fatal(ledger_path.as_ref(), reason);
    }
    info!("Playtime daemon stopped");
}

fn spawn_pinger(connections: Arc<ConnectionManager>, every: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = connections.ping_all().await;
                    if report.dropped > 0 {
                        info!(dropped = report.dropped, "Dropped unresponsive displays");
                    }
                }
            }
        }
    });
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
