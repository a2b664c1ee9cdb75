//! Record of the daemon's own fatal exits.
//!
//! Every path that ends the process with status 1 (store unavailable, listener
//! bind failure, evaluator death) appends a `CrashRecord`. On the next start the
//! supervisor's restart is held back in proportion to how many of those
//! happened recently. Clean shutdowns and ordinary restarts leave no trace.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use tracing::{error, warn};

/// Crashes older than this no longer slow startup.
const RECENT_WINDOW_MINS: i64 = 10;
const MAX_RECORDS: usize = 16;
const FIRST_DELAY_SECS: u64 = 2;
const MAX_DELAY_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CrashLedger {
    crashes: Vec<CrashRecord>,
}

impl CrashLedger {
    /// Unreadable or missing ledgers start empty.
    pub fn load(path: &Path) -> Self {
        let data = match fs_err::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                warn!(error = %err, "Ignoring unreadable crash ledger");
                return Self::default();
            }
        };
        serde_json::from_slice(&data).unwrap_or_else(|err| {
            warn!(error = %err, "Ignoring malformed crash ledger");
            Self::default()
        })
    }

    pub fn recent(&self, now: DateTime<Utc>) -> usize {
        let window = Duration::minutes(RECENT_WINDOW_MINS);
        self.crashes
            .iter()
            .filter(|crash| now.signed_duration_since(crash.at) <= window)
            .count()
    }

    /// Hold-off before serving again: 2s after one recent crash, doubling per
    /// further crash, capped at a minute.
    pub fn restart_delay(&self, now: DateTime<Utc>) -> Option<StdDuration> {
        let recent = self.recent(now);
        if recent == 0 {
            return None;
        }
        let factor = 1u64.checked_shl((recent - 1) as u32).unwrap_or(u64::MAX);
        let secs = FIRST_DELAY_SECS.saturating_mul(factor).min(MAX_DELAY_SECS);
        Some(StdDuration::from_secs(secs))
    }

    pub fn push(&mut self, now: DateTime<Utc>, reason: impl Into<String>) {
        self.crashes.push(CrashRecord {
            at: now,
            reason: reason.into(),
        });
        if self.crashes.len() > MAX_RECORDS {
            let excess = self.crashes.len() - MAX_RECORDS;
            self.crashes.drain(..excess);
        }
    }

    pub fn last(&self) -> Option<&CrashRecord> {
        self.crashes.last()
    }

    fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent).map_err(|err| err.to_string())?;
        }
        let payload = serde_json::to_vec_pretty(self).map_err(|err| err.to_string())?;
        let staging = path.with_extension("json.new");
        fs_err::write(&staging, payload).map_err(|err| err.to_string())?;
        fs_err::rename(&staging, path).map_err(|err| err.to_string())
    }
}

/// Sleeps off recent crashes before the daemon binds anything.
pub async fn hold_off(path: &Path) {
    let now = Utc::now();
    let ledger = CrashLedger::load(path);
    if let Some(delay) = ledger.restart_delay(now) {
        warn!(
            recent_crashes = ledger.recent(now),
            last_reason = ledger.last().map(|crash| crash.reason.as_str()).unwrap_or(""),
            delay_secs = delay.as_secs(),
            "Daemon crashed recently; delaying startup"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Logs, records the crash (when the ledger path is known) and exits with 1.
pub fn fatal(path: Option<&PathBuf>, reason: &str) -> ! {
    error!(reason, "Playtime daemon exiting after fatal error");
    if let Some(path) = path {
        let mut ledger = CrashLedger::load(path);
        ledger.push(Utc::now(), reason);
        if let Err(err) = ledger.save(path) {
            warn!(error = %err, "Failed to record crash");
        }
    }
    std::process::exit(1);
}
