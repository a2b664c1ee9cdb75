//! Registry of live display connections and broadcast fan-out.
//!
//! The manager is the only owner of the connection set. Callers get
//! `register`/`mark_open`/`unregister`/`broadcast`; the map itself never leaves
//! this module.
//!
//! Locking discipline: the registry mutex is held only to mutate the map or
//! to copy out the current send handles. Frames are delivered after the lock
//! is released, concurrently and each bounded by `send_timeout`; failed
//! connections are removed under the lock afterwards.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use playtime_daemon_protocol::ServerMessage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SendError;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Identity supplied by the authentication collaborator at handshake time.
/// Carried for future per-role filtering; fan-out ignores it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
}

/// Frames handed to a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    Ping,
}

pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Cancelled when the manager drops the connection.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    #[serde(flatten)]
    pub info: ConnectionInfo,
}

struct Entry {
    info: ConnectionInfo,
    connected_at: DateTime<Utc>,
    state: ConnectionState,
    sender: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
}

pub struct ConnectionManager {
    registry: Mutex<HashMap<ConnectionId, Entry>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    /// Adds a connection in the `connecting` state. Never fails.
    pub fn register(&self, info: ConnectionInfo, sender: mpsc::Sender<Outbound>) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shutdown = CancellationToken::new();
        let entry = Entry {
            info,
            connected_at: Utc::now(),
            state: ConnectionState::Connecting,
            sender,
            shutdown: shutdown.clone(),
        };

        let total = {
            let mut registry = self.registry();
            registry.insert(id, entry);
            registry.len()
        };
        info!(connection_id = id, connections = total, "Connection registered");

        ConnectionHandle { id, shutdown }
    }

    /// `connecting -> open`. Returns false if the connection is gone or closing.
    pub fn mark_open(&self, id: ConnectionId) -> bool {
        self.transition(id, ConnectionState::Connecting, ConnectionState::Open)
    }

    /// `open -> closing`: the peer asked to close, stop sending it broadcasts.
    pub fn mark_closing(&self, id: ConnectionId) -> bool {
        self.transition(id, ConnectionState::Open, ConnectionState::Closing)
    }

    /// Removes a connection. Safe to call any number of times.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let (removed, total) = {
            let mut registry = self.registry();
            let removed = registry.remove(&id);
            (removed, registry.len())
        };

        match removed {
            Some(entry) => {
                entry.shutdown.cancel();
                info!(
                    connection_id = id,
                    role = ?entry.info.role,
                    connections = total,
                    "Connection unregistered"
                );
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        self.registry()
            .get(&id)
            .map(|entry| entry.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn open_count(&self) -> usize {
        self.registry()
            .values()
            .filter(|entry| entry.state == ConnectionState::Open)
            .count()
    }

    pub fn snapshot_info(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<ConnectionSummary> = self
            .registry()
            .iter()
            .map(|(id, entry)| ConnectionSummary {
                id: *id,
                state: entry.state,
                connected_at: entry.connected_at,
                info: entry.info.clone(),
            })
            .collect();
        summaries.sort_by_key(|summary| summary.id);
        summaries
    }

    /// Sends `message` to every open connection. Failures drop the failing
    /// connection and are never returned to the caller.
    pub async fn broadcast(&self, message: &ServerMessage) -> BroadcastReport {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, kind = message.kind(), "Failed to serialize broadcast");
                return BroadcastReport::default();
            }
        };

        let report = self.fan_out(Outbound::Text(Arc::from(text))).await;
        debug!(
            kind = message.kind(),
            delivered = report.delivered,
            dropped = report.dropped,
            "Broadcast complete"
        );
        report
    }

    /// Queues a transport-level ping on every open connection.
    pub async fn ping_all(&self) -> BroadcastReport {
        self.fan_out(Outbound::Ping).await
    }

    /// Sends to one connection, e.g. the snapshot that greets a new display.
    pub async fn send_to(&self, id: ConnectionId, message: &ServerMessage) -> Result<(), SendError> {
        let sender = self
            .registry()
            .get(&id)
            .map(|entry| entry.sender.clone())
            .ok_or(SendError::Closed)?;

        let text = serde_json::to_string(message).map_err(|err| {
            warn!(error = %err, kind = message.kind(), "Failed to serialize message");
            SendError::Closed
        })?;

        let result = deliver(&sender, Outbound::Text(Arc::from(text)), self.send_timeout).await;
        if let Err(err) = &result {
            debug!(connection_id = id, error = %err, "Direct send failed");
            self.unregister(id);
        }
        result
    }

    async fn fan_out(&self, frame: Outbound) -> BroadcastReport {
        let targets: Vec<(ConnectionId, mpsc::Sender<Outbound>)> = self
            .registry()
            .iter()
            .filter(|(_, entry)| entry.state == ConnectionState::Open)
            .map(|(id, entry)| (*id, entry.sender.clone()))
            .collect();

        let timeout = self.send_timeout;
        let results = join_all(targets.into_iter().map(|(id, sender)| {
            let frame = frame.clone();
            async move { (id, deliver(&sender, frame, timeout).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(connection_id = id, error = %err, "Dropping connection after failed send");
                    self.unregister(id);
                    report.dropped += 1;
                }
            }
        }
        report
    }

    fn transition(&self, id: ConnectionId, from: ConnectionState, to: ConnectionState) -> bool {
        let mut registry = self.registry();
        match registry.get_mut(&id) {
            Some(entry) if entry.state == from => {
                entry.state = to;
                true
            }
            _ => false,
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn deliver(
    sender: &mpsc::Sender<Outbound>,
    frame: Outbound,
    timeout: Duration,
) -> Result<(), SendError> {
    match tokio::time::timeout(timeout, sender.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(SendError::Closed),
        Err(_) => Err(SendError::TimedOut(timeout.as_millis() as u64)),
    }
}
