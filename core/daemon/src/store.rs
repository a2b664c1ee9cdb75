//! SQLite persistence for play-session timers.
//!
//! This is the single-writer store backing the daemon. The sales and extension
//! collaborators write through the HTTP surface; the evaluator only ever
//! touches `status` and `last_alert_tier`.

use chrono::{DateTime, Duration, Utc};
use playtime_daemon_protocol::{AlertTier, TimerStatus};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::PathBuf;
use tracing::warn;

use crate::alert::tier_after_extension;
use crate::config::ExtensionTierPolicy;
use crate::error::{StoreError, StoreResult};
use crate::timer::{format_timestamp, parse_rfc3339, NewTimer, Timer};

const TIMER_COLUMNS: &str = "id, child_name, child_age, start_at, end_at, extended_minutes, \
     status, last_alert_tier, updated_at";

/// Everything the rest of the daemon needs from timer persistence.
///
/// Implementations must be callable from blocking worker threads.
pub trait TimerStore: Send + Sync {
    fn create(&self, timer: NewTimer, now: DateTime<Utc>) -> StoreResult<Timer>;

    fn extend(
        &self,
        timer_id: &str,
        minutes: u32,
        policy: ExtensionTierPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Timer>;

    fn get(&self, timer_id: &str) -> StoreResult<Option<Timer>>;

    /// Timers still counting down (`active` or `alert`).
    fn list_evaluable(&self) -> StoreResult<Vec<Timer>>;

    /// Evaluable timers plus expired ones whose end lies within `grace`.
    fn list_visible(&self, now: DateTime<Utc>, grace: Duration) -> StoreResult<Vec<Timer>>;

    /// Writes an evaluator transition. Returns `false` without writing when
    /// the timer's `end_at` moved since it was read (an extension raced the
    /// evaluator); the next cycle re-evaluates it.
    fn record_progress(
        &self,
        timer_id: &str,
        observed_end_at: DateTime<Utc>,
        status: TimerStatus,
        last_alert_tier: Option<AlertTier>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Deletes expired timers that ended before `before`.
    fn prune_expired(&self, before: DateTime<Utc>) -> StoreResult<usize>;
}

pub struct SqliteTimerStore {
    path: PathBuf,
}

impl SqliteTimerStore {
    pub fn new(path: PathBuf) -> StoreResult<Self> {
        let store = Self { path };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS timers (
                    id TEXT PRIMARY KEY,
                    child_name TEXT NOT NULL,
                    child_age INTEGER,
                    start_at TEXT NOT NULL,
                    end_at TEXT NOT NULL,
                    extended_minutes INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    last_alert_tier INTEGER,
                    updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_timers_status ON timers(status);
                 COMMIT;",
            )
            .map_err(|err| StoreError::sqlite("Failed to initialize timers schema", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> StoreResult<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| StoreError::Io {
                context: "Failed to create daemon data dir".to_string(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| StoreError::sqlite("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| StoreError::sqlite("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| StoreError::sqlite("Failed to set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| StoreError::sqlite("Failed to set busy_timeout", err))?;

        Ok(conn)
    }

    fn query_timers(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<Timer>> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|err| StoreError::sqlite("Failed to prepare timers query", err))?;
        let rows = stmt
            .query_map(params, read_row)
            .map_err(|err| StoreError::sqlite("Failed to read timer rows", err))?;

        let mut timers = Vec::new();
        for row in rows {
            let raw = row.map_err(|err| StoreError::sqlite("Failed to decode timer row", err))?;
            match raw.into_timer() {
                Ok(timer) => timers.push(timer),
                Err(err) => warn!(error = %err, "Skipping unreadable timer row"),
            }
        }
        Ok(timers)
    }

    fn get_with(conn: &Connection, timer_id: &str) -> StoreResult<Option<Timer>> {
        let sql = format!("SELECT {} FROM timers WHERE id = ?1", TIMER_COLUMNS);
        let raw = conn
            .query_row(&sql, params![timer_id], read_row)
            .optional()
            .map_err(|err| StoreError::sqlite("Failed to query timer", err))?;
        raw.map(RawTimer::into_timer).transpose()
    }
}

impl TimerStore for SqliteTimerStore {
    fn create(&self, timer: NewTimer, now: DateTime<Utc>) -> StoreResult<Timer> {
        if timer.duration <= Duration::zero() {
            return Err(StoreError::InvalidInput(
                "duration must be positive".to_string(),
            ));
        }

        let record = Timer {
            end_at: timer.end_at(),
            id: timer.id,
            child_name: timer.child_name,
            child_age: timer.child_age,
            start_at: timer.start_at,
            extended_minutes: 0,
            status: TimerStatus::Active,
            last_alert_tier: None,
            updated_at: now,
        };

        self.with_connection(|conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO timers \
                        (id, child_name, child_age, start_at, end_at, extended_minutes, \
                         status, last_alert_tier, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, NULL, ?7) \
                     ON CONFLICT(id) DO NOTHING",
                    params![
                        record.id,
                        record.child_name,
                        record.child_age,
                        format_timestamp(record.start_at),
                        format_timestamp(record.end_at),
                        record.status.as_str(),
                        format_timestamp(record.updated_at),
                    ],
                )
                .map_err(|err| StoreError::sqlite("Failed to insert timer", err))?;

            if inserted == 0 {
                return Err(StoreError::AlreadyExists(record.id.clone()));
            }
            Ok(())
        })?;

        Ok(record)
    }

    fn extend(
        &self,
        timer_id: &str,
        minutes: u32,
        policy: ExtensionTierPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Timer> {
        if minutes == 0 {
            return Err(StoreError::InvalidInput(
                "extension must be at least one minute".to_string(),
            ));
        }

        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| StoreError::sqlite("Failed to start extension", err))?;

            let mut timer = Self::get_with(&tx, timer_id)?
                .ok_or_else(|| StoreError::NotFound(timer_id.to_string()))?;
            if timer.status == TimerStatus::Expired {
                return Err(StoreError::Expired(timer_id.to_string()));
            }

            timer.end_at = timer.end_at + Duration::minutes(i64::from(minutes));
            timer.extended_minutes = timer.extended_minutes.saturating_add(minutes);
            timer.last_alert_tier =
                tier_after_extension(timer.last_alert_tier, timer.remaining(now), policy);
            timer.updated_at = now;

            tx.execute(
                "UPDATE timers SET end_at = ?1, extended_minutes = ?2, last_alert_tier = ?3, \
                    updated_at = ?4 \
                 WHERE id = ?5",
                params![
                    format_timestamp(timer.end_at),
                    timer.extended_minutes,
                    timer.last_alert_tier.map(u8::from),
                    format_timestamp(timer.updated_at),
                    timer.id,
                ],
            )
            .map_err(|err| StoreError::sqlite("Failed to extend timer", err))?;

            tx.commit()
                .map_err(|err| StoreError::sqlite("Failed to commit extension", err))?;
            Ok(timer)
        })
    }

    fn get(&self, timer_id: &str) -> StoreResult<Option<Timer>> {
        self.with_connection(|conn| Self::get_with(conn, timer_id))
    }

    fn list_evaluable(&self) -> StoreResult<Vec<Timer>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM timers WHERE status IN ('active', 'alert') ORDER BY end_at ASC, id ASC",
                TIMER_COLUMNS
            );
            Self::query_timers(conn, &sql, [])
        })
    }

    fn list_visible(&self, now: DateTime<Utc>, grace: Duration) -> StoreResult<Vec<Timer>> {
        // An out-of-range grace keeps every expired timer visible.
        let cutoff = format_timestamp(now.checked_sub_signed(grace).unwrap_or_default());
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM timers \
                 WHERE status IN ('active', 'alert') OR (status = 'expired' AND end_at >= ?1) \
                 ORDER BY end_at ASC, id ASC",
                TIMER_COLUMNS
            );
            Self::query_timers(conn, &sql, params![cutoff])
        })
    }

    fn record_progress(
        &self,
        timer_id: &str,
        observed_end_at: DateTime<Utc>,
        status: TimerStatus,
        last_alert_tier: Option<AlertTier>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE timers SET status = ?1, last_alert_tier = ?2, updated_at = ?3 \
                     WHERE id = ?4 AND end_at = ?5 AND status != 'expired'",
                    params![
                        status.as_str(),
                        last_alert_tier.map(u8::from),
                        format_timestamp(now),
                        timer_id,
                        format_timestamp(observed_end_at),
                    ],
                )
                .map_err(|err| StoreError::sqlite("Failed to record timer progress", err))?;

            if updated > 0 {
                return Ok(true);
            }
            match Self::get_with(conn, timer_id)? {
                Some(_) => Ok(false),
                None => Err(StoreError::NotFound(timer_id.to_string())),
            }
        })
    }

    fn prune_expired(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM timers WHERE status = 'expired' AND end_at < ?1",
                params![format_timestamp(before)],
            )
            .map_err(|err| StoreError::sqlite("Failed to prune expired timers", err))
        })
    }
}

/// Column values as stored, decoded into a [`Timer`] separately so one bad
/// row does not poison a whole listing.
struct RawTimer {
    id: String,
    child_name: String,
    child_age: Option<i64>,
    start_at: String,
    end_at: String,
    extended_minutes: i64,
    status: String,
    last_alert_tier: Option<i64>,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawTimer> {
    Ok(RawTimer {
        id: row.get(0)?,
        child_name: row.get(1)?,
        child_age: row.get(2)?,
        start_at: row.get(3)?,
        end_at: row.get(4)?,
        extended_minutes: row.get(5)?,
        status: row.get(6)?,
        last_alert_tier: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl RawTimer {
    fn into_timer(self) -> StoreResult<Timer> {
        let corrupt = |details: String| StoreError::Corrupt {
            timer_id: self.id.clone(),
            details,
        };

        let status = TimerStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status {:?}", self.status)))?;
        let last_alert_tier = match self.last_alert_tier {
            Some(value) => Some(
                u8::try_from(value)
                    .map_err(|_| corrupt(format!("tier out of range: {}", value)))
                    .and_then(|value| AlertTier::try_from(value).map_err(corrupt))?,
            ),
            None => None,
        };
        let start_at = parse_rfc3339(&self.start_at)
            .ok_or_else(|| corrupt(format!("bad start_at {:?}", self.start_at)))?;
        let end_at = parse_rfc3339(&self.end_at)
            .ok_or_else(|| corrupt(format!("bad end_at {:?}", self.end_at)))?;
        let updated_at = parse_rfc3339(&self.updated_at).unwrap_or(start_at);
        let child_age = self.child_age.and_then(|age| u8::try_from(age).ok());
        let extended_minutes = u32::try_from(self.extended_minutes).unwrap_or(0);

        if end_at <= start_at {
            return Err(corrupt("end_at must be after start_at".to_string()));
        }

        Ok(Timer {
            id: self.id,
            child_name: self.child_name,
            child_age,
            start_at,
            end_at,
            extended_minutes,
            status,
            last_alert_tier,
            updated_at,
        })
    }
}
