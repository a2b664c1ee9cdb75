//! playtime-display: terminal display for the playtime daemon.
//!
//! Connects to the daemon's WebSocket, prints each new alert and expiry once,
//! and shows a reconnecting indicator while the daemon is unreachable.

mod logging;

use clap::Parser;
use playtime_daemon_protocol::{ServerMessage, TimerStatus};
use playtime_display::{
    endpoint_url, ClientEvent, ClientSocket, DisplayState, Notification, SocketState,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EVENT_BUFFER: usize = 64;
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "playtime-display")]
#[command(about = "Live timer alerts from the playtime daemon")]
#[command(version)]
struct Cli {
    /// Daemon WebSocket endpoint
    #[arg(long, default_value = "ws://127.0.0.1:7878/ws")]
    url: String,

    /// Role reported to the daemon (e.g. staff, kiosk)
    #[arg(long)]
    role: Option<String>,

    /// Identity reported to the daemon
    #[arg(long)]
    identity: Option<String>,

    /// Print the full timer board on every update
    #[arg(long)]
    board: bool,

    /// Reconnect when the daemon sends nothing (not even a ping) for this long
    #[arg(long, default_value_t = 60)]
    idle_timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let endpoint = match endpoint_url(&cli.url, cli.role.as_deref(), cli.identity.as_deref()) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            error!(error = %err, "Cannot start display");
            std::process::exit(2);
        }
    };

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let socket = ClientSocket::new(endpoint, tx)
        .with_idle_timeout(Duration::from_secs(cli.idle_timeout_secs.max(1)))
        .spawn(cancel.clone());
    let mut display = DisplayState::default();

    println!("[{}]", playtime_display::view::RECONNECTING_INDICATOR);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; closing display");
                break;
            }
            event = rx.recv() => match event {
                Some(event) => handle_event(&mut display, event, cli.board),
                None => break,
            },
        }
    }

    cancel.cancel();
    if tokio::time::timeout(STOP_TIMEOUT, socket).await.is_err() {
        warn!("Client socket did not stop in time");
    }
}

fn handle_event(display: &mut DisplayState, event: ClientEvent, board: bool) {
    match event {
        ClientEvent::State(state) => {
            let was_connected = display.connection() == SocketState::Connected;
            display.set_connection(state);
            match display.indicator() {
                Some(indicator) if was_connected => println!("[{}]", indicator),
                None => println!("[connected]"),
                Some(_) => {}
            }
        }
        ClientEvent::RetryScheduled { attempt, delay } => {
            println!(
                "[{}] retry #{} in {}s",
                playtime_display::view::RECONNECTING_INDICATOR,
                attempt,
                delay.as_secs()
            );
        }
        ClientEvent::Message(message) => {
            let is_snapshot = matches!(message, ServerMessage::TimersUpdate { .. });
            for notification in display.apply(message) {
                print_notification(&notification);
            }
            if board && is_snapshot {
                print_board(display);
            }
        }
    }
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::Alert {
            child_name,
            tier,
            remaining_minutes,
            ..
        } => println!(
            "ALERT  {}: {} min left ({}-minute warning)",
            child_name, remaining_minutes, tier
        ),
        Notification::Expired { child_name, .. } => println!("TIME   {}: play time is over", child_name),
    }
}

fn print_board(display: &DisplayState) {
    println!("---");
    for timer in display.timers() {
        let marker = match timer.status {
            TimerStatus::Active => " ",
            TimerStatus::Alert => "!",
            TimerStatus::Expired => "x",
        };
        let remaining = timer.remaining_seconds.max(0);
        println!(
            "{} {:<24} {:>3}:{:02}",
            marker,
            timer.child_name,
            remaining / 60,
            remaining % 60
        );
    }
}
