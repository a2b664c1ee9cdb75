//! Display-side client for the playtime daemon.
//!
//! `ClientSocket` keeps a WebSocket to the daemon alive across restarts and
//! network blips; `DisplayState` folds the server's messages into a local view
//! and decides which alerts are worth showing.

pub mod backoff;
pub mod dedupe;
pub mod error;
pub mod socket;
pub mod view;

pub use backoff::ReconnectBackoff;
pub use dedupe::AlertLedger;
pub use error::ConnectError;
pub use socket::{endpoint_url, ClientEvent, ClientSocket, SocketState};
pub use view::{DisplayState, Notification};
