//! Error types for the daemon's store, broadcast and config layers.

use std::path::PathBuf;

/// Failures reading or writing timers.
///
/// During an evaluation cycle these are logged per timer and never abort the
/// cycle; through the HTTP surface they map to an error envelope.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Timer store unavailable: {context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Timer store I/O failed: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt timer row {timer_id}: {details}")]
    Corrupt { timer_id: String, details: String },

    #[error("Timer not found: {0}")]
    NotFound(String),

    #[error("Timer already exists: {0}")]
    AlreadyExists(String),

    #[error("Timer already expired: {0}")]
    Expired(String),

    #[error("Invalid timer: {0}")]
    InvalidInput(String),
}

impl StoreError {
    pub fn sqlite(context: impl Into<String>, source: rusqlite::Error) -> Self {
        StoreError::Sqlite {
            context: context.into(),
            source,
        }
    }

    /// Stable code used in HTTP error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Sqlite { .. } | StoreError::Io { .. } => "store_error",
            StoreError::Corrupt { .. } => "corrupt_timer",
            StoreError::NotFound(_) => "not_found",
            StoreError::AlreadyExists(_) => "already_exists",
            StoreError::Expired(_) => "timer_expired",
            StoreError::InvalidInput(_) => "invalid_timer",
        }
    }
}

/// A single connection could not take a broadcast frame.
///
/// Never escapes `ConnectionManager::broadcast`; the connection is dropped instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,

    #[error("send timed out after {0}ms")]
    TimedOut(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config value for {field}: {details}")]
    Invalid { field: String, details: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
