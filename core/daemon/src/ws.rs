//! WebSocket endpoint for display clients.
//!
//! Each socket gets a writer task fed by a bounded channel registered with the
//! `ConnectionManager`. The reader side only watches for close frames; displays
//! never send application messages.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use chrono::Utc;
use futures::{Sink, SinkExt, StreamExt};
use playtime_daemon_protocol::{ServerMessage, TimerView};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connections::{ConnectionId, ConnectionInfo, Outbound};
use crate::state::SharedState;

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Identity passed through by the authentication collaborator.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub role: Option<String>,
    pub identity: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(params): Query<ConnectParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let info = ConnectionInfo {
        role: params.role,
        identity: params.identity,
        peer: Some(peer.to_string()),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, info))
}

async fn handle_socket(socket: WebSocket, state: SharedState, info: ConnectionInfo) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(state.config.broadcast.channel_capacity);
    let handle = state.connections.register(info, tx);
    let id = handle.id;
    let write_timeout = state.config.broadcast.send_timeout();

    let writer = tokio::spawn(write_frames(
        ws_tx,
        rx,
        handle.shutdown.clone(),
        write_timeout,
        id,
    ));

    match initial_snapshot(&state).await {
        Some(message) => {
            if let Err(err) = state.connections.send_to(id, &message).await {
                warn!(connection_id = id, error = %err, "Failed to send initial snapshot");
            }
        }
        None => debug!(connection_id = id, "No initial snapshot available"),
    }
    state.connections.mark_open(id);

    loop {
        tokio::select! {
            _ = handle.shutdown.cancelled() => break,
            _ = state.shutdown.cancelled() => break,
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) => {
                    state.connections.mark_closing(id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(connection_id = id, error = %err, "Socket read failed");
                    break;
                }
                None => break,
            },
        }
    }

    state.connections.unregister(id);
    if let Err(err) = writer.await {
        warn!(connection_id = id, error = %err, "Socket writer task failed");
    }
    info!(connection_id = id, "Display connection finished");
}

/// Drains `rx` into the socket. A failed or timed-out write cancels `token`,
/// which ends the reader loop and unregisters the connection.
async fn write_frames<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    token: CancellationToken,
    write_timeout: Duration,
    id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let message = match frame {
            Outbound::Text(text) => Message::Text(text.to_string().into()),
            Outbound::Ping => Message::Ping(axum::body::Bytes::new()),
        };
        match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(connection_id = id, error = %err, "Socket write failed");
                token.cancel();
                break;
            }
            Err(_) => {
                debug!(connection_id = id, "Socket write timed out");
                token.cancel();
                break;
            }
        }
    }
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
}

/// Current countdowns for a display that just connected, so it does not wait
/// for the next evaluation cycle.
async fn initial_snapshot(state: &SharedState) -> Option<ServerMessage> {
    let now = Utc::now();
    match state.with_store(|store| store.list_evaluable()).await {
        Ok(timers) => {
            let timers: Vec<TimerView> = timers.iter().map(|timer| timer.view(now)).collect();
            Some(ServerMessage::TimersUpdate { timers })
        }
        Err(err) => {
            warn!(error = %err, "Failed to load timers for initial snapshot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{ConnectionHandle, ConnectionManager};
    use std::sync::Arc;

    const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

    fn registered(
        manager: &ConnectionManager,
    ) -> (ConnectionHandle, mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        let handle = manager.register(ConnectionInfo::default(), tx.clone());
        manager.mark_open(handle.id);
        (handle, tx, rx)
    }

    #[tokio::test]
    async fn failed_write_cancels_connection() {
        let manager = ConnectionManager::new(WRITE_TIMEOUT);
        let (handle, tx, rx) = registered(&manager);
        let sink = Box::pin(futures::sink::unfold((), |(), _message: Message| async move {
            Err::<(), _>("broken pipe")
        }));

        let writer = tokio::spawn(write_frames(
            sink,
            rx,
            handle.shutdown.clone(),
            WRITE_TIMEOUT,
            handle.id,
        ));
        tx.send(Outbound::Text(Arc::from("{}"))).await.expect("queue frame");

        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer stopped")
            .expect("writer task");
        assert!(handle.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn stalled_write_cancels_connection() {
        let manager = ConnectionManager::new(WRITE_TIMEOUT);
        let (handle, tx, rx) = registered(&manager);
        let sink = Box::pin(futures::sink::unfold((), |(), _message: Message| async move {
            std::future::pending::<()>().await;
            Ok::<(), String>(())
        }));

        let writer = tokio::spawn(write_frames(
            sink,
            rx,
            handle.shutdown.clone(),
            WRITE_TIMEOUT,
            handle.id,
        ));
        tx.send(Outbound::Ping).await.expect("queue frame");

        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer stopped")
            .expect("writer task");
        assert!(handle.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn healthy_writes_keep_connection_open() {
        let manager = ConnectionManager::new(WRITE_TIMEOUT);
        let (handle, tx, rx) = registered(&manager);
        let (sink_tx, mut sink_rx) = futures::channel::mpsc::unbounded::<Message>();

        let writer = tokio::spawn(write_frames(
            sink_tx,
            rx,
            handle.shutdown.clone(),
            WRITE_TIMEOUT,
            handle.id,
        ));
        tx.send(Outbound::Text(Arc::from("hello"))).await.expect("queue frame");
        let first = tokio::time::timeout(Duration::from_secs(1), sink_rx.next())
            .await
            .expect("frame written");
        assert!(matches!(first, Some(Message::Text(ref text)) if text.as_str() == "hello"));
        assert!(!handle.shutdown.is_cancelled());

        manager.unregister(handle.id);
        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer stopped")
            .expect("writer task");
        assert!(matches!(sink_rx.next().await, Some(Message::Close(None))));
    }
}
