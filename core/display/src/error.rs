use std::time::Duration;
use tokio_tungstenite::tungstenite;

/// Why a display session ended. Every variant feeds the reconnect loop; none
/// is fatal to the display.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("connection lost: {0}")]
    Read(#[source] tungstenite::Error),

    #[error("server closed the connection ({reason})")]
    Closed { reason: String },

    #[error("connection ended without a close frame")]
    Eof,

    #[error("no frames from the server for {0:?}")]
    Idle(Duration),

    #[error("invalid daemon url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}
