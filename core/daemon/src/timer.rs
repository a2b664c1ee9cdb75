//! Timer records as the daemon stores and evaluates them.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use playtime_daemon_protocol::{AlertTier, CreateTimerRequest, TimerStatus, TimerView};
use rand::RngCore;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timer {
    pub id: String,
    pub child_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_age: Option<u8>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub extended_minutes: u32,
    pub status: TimerStatus,
    pub last_alert_tier: Option<AlertTier>,
    pub updated_at: DateTime<Utc>,
}

impl Timer {
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.end_at.signed_duration_since(now)
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.remaining(now).num_seconds().max(0)
    }

    pub fn is_evaluable(&self) -> bool {
        self.status != TimerStatus::Expired
    }

    pub fn view(&self, now: DateTime<Utc>) -> TimerView {
        TimerView {
            id: self.id.clone(),
            child_name: self.child_name.clone(),
            remaining_seconds: self.remaining_seconds(now),
            status: self.status,
            alert_tier: self.last_alert_tier,
        }
    }
}

/// A timer as handed over by the sales component, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTimer {
    pub id: String,
    pub child_name: String,
    pub child_age: Option<u8>,
    pub start_at: DateTime<Utc>,
    pub duration: Duration,
}

impl NewTimer {
    /// Builds a timer from an already-validated request.
    pub fn from_request(request: CreateTimerRequest, now: DateTime<Utc>) -> Self {
        let start_at = request
            .start_at
            .as_deref()
            .and_then(parse_rfc3339)
            .unwrap_or(now);
        let id = request
            .id
            .map(|id| id.trim().to_string())
            .unwrap_or_else(|| make_timer_id(now));

        Self {
            id,
            child_name: request.child_name.trim().to_string(),
            child_age: request.child_age,
            start_at,
            duration: Duration::minutes(i64::from(request.duration_minutes)),
        }
    }

    pub fn end_at(&self) -> DateTime<Utc> {
        self.start_at + self.duration
    }
}

pub fn make_timer_id(now: DateTime<Utc>) -> String {
    let mut random = rand::thread_rng();
    format!("tmr-{}-{:08x}", now.timestamp_millis(), random.next_u32())
}

/// Fixed-width UTC timestamps keep SQL string comparisons chronological.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whole minutes left, rounded up so a 14:30 countdown reads as 15.
pub fn remaining_minutes_ceil(remaining: Duration) -> i64 {
    let millis = remaining.num_milliseconds().max(0);
    (millis + 59_999) / 60_000
}
