//! Reconnecting WebSocket client.
//!
//! `disconnected -> connecting -> connected -> disconnected`, forever, until
//! the cancellation token fires or the event receiver goes away. Each
//! disconnect schedules the next attempt through `ReconnectBackoff`; the
//! backoff resets as soon as a handshake succeeds. A session that hears
//! nothing from the daemon (not even a ping) for `idle_timeout` is treated as
//! lost, so a half-open TCP connection still ends in a reconnect.

use futures::StreamExt;
use playtime_daemon_protocol::{parse_server_message, ServerMessage};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::ReconnectBackoff;
use crate::error::ConnectError;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Three missed daemon pings at the default 20s interval.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    State(SocketState),
    Message(ServerMessage),
    /// Next attempt is `attempt` (1-based since the last good connection),
    /// made after `delay`.
    RetryScheduled { attempt: u32, delay: Duration },
}

enum SessionEnd {
    Stopped,
    Lost(ConnectError),
}

pub struct ClientSocket {
    url: String,
    backoff: ReconnectBackoff,
    idle_timeout: Duration,
    state: SocketState,
    events: mpsc::Sender<ClientEvent>,
}

/// `base` with the display's role and identity appended as query parameters.
pub fn endpoint_url(
    base: &str,
    role: Option<&str>,
    identity: Option<&str>,
) -> Result<String, ConnectError> {
    let mut url = Url::parse(base).map_err(|source| ConnectError::InvalidUrl {
        url: base.to_string(),
        source,
    })?;
    let params: Vec<(&str, &str)> = [("role", role), ("identity", identity)]
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key, value)))
        .collect();
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url.into())
}

impl ClientSocket {
    pub fn new(url: impl Into<String>, events: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            url: url.into(),
            backoff: ReconnectBackoff::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            state: SocketState::Disconnected,
            events,
        }
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() || !self.set_state(SocketState::Connecting).await {
                break;
            }

            let connect = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = connect_async(self.url.as_str()) => result,
            };

            match connect {
                Ok((ws, _)) => {
                    self.backoff.reset();
                    if !self.set_state(SocketState::Connected).await {
                        close_quietly(ws).await;
                        break;
                    }
                    info!(url = %self.url, "Connected to daemon");
                    match self.session(ws, &cancel).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost(err) => warn!(error = %err, "Lost connection to daemon"),
                    }
                }
                Err(source) => {
                    let err = ConnectError::Handshake {
                        url: self.url.clone(),
                        source,
                    };
                    warn!(error = %err, "Failed to connect to daemon");
                }
            }

            if !self.set_state(SocketState::Disconnected).await {
                break;
            }
            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt();
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            if !self.emit(ClientEvent::RetryScheduled { attempt, delay }).await {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.state != SocketState::Disconnected {
            self.state = SocketState::Disconnected;
            let _ = self
                .events
                .try_send(ClientEvent::State(SocketState::Disconnected));
        }
        debug!("Client socket stopped");
    }

    async fn session(&mut self, mut ws: WsStream, cancel: &CancellationToken) -> SessionEnd {
        loop {
            let incoming = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    close_quietly(ws).await;
                    return SessionEnd::Stopped;
                }
                incoming = tokio::time::timeout(self.idle_timeout, ws.next()) => incoming,
            };
            let Ok(incoming) = incoming else {
                close_quietly(ws).await;
                return SessionEnd::Lost(ConnectError::Idle(self.idle_timeout));
            };

            match incoming {
                Some(Ok(Message::Text(text))) => match parse_server_message(text.as_str()) {
                    Ok(message) => {
                        if !self.emit(ClientEvent::Message(message)).await {
                            close_quietly(ws).await;
                            return SessionEnd::Stopped;
                        }
                    }
                    Err(err) => {
                        warn!(code = %err.code, message = %err.message, "Ignoring malformed server message")
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.as_str().to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "no reason".to_string());
                    return SessionEnd::Lost(ConnectError::Closed { reason });
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return SessionEnd::Lost(ConnectError::Read(err)),
                None => return SessionEnd::Lost(ConnectError::Eof),
            }
        }
    }

    async fn set_state(&mut self, state: SocketState) -> bool {
        if self.state == state {
            return true;
        }
        self.state = state;
        self.emit(ClientEvent::State(state)).await
    }

    /// False once nobody is listening; the loop treats that like cancellation.
    async fn emit(&self, event: ClientEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

async fn close_quietly(mut ws: WsStream) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
}
