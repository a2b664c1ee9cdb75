//! Wire protocol types and validation for playtime-daemon.
//!
//! This crate is shared by the daemon and its display clients to prevent
//! schema drift. The daemon remains the authority on validation, but clients
//! reuse the same types to decode pushed state and to build HTTP requests.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TIMER_ID_LEN: usize = 128;
pub const MAX_CHILD_NAME_LEN: usize = 120;
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

/// Alert thresholds ordered by severity: `Fifteen < Ten < Five`.
///
/// On the wire a tier is the bare number of minutes (`15`, `10`, `5`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AlertTier {
    Fifteen,
    Ten,
    Five,
}

impl AlertTier {
    /// Least severe first, which is also the order thresholds are crossed in.
    pub const ALL: [AlertTier; 3] = [AlertTier::Fifteen, AlertTier::Ten, AlertTier::Five];

    pub fn minutes(self) -> u8 {
        match self {
            AlertTier::Fifteen => 15,
            AlertTier::Ten => 10,
            AlertTier::Five => 5,
        }
    }

    pub fn threshold_secs(self) -> i64 {
        i64::from(self.minutes()) * 60
    }

    /// True when `self` should be shown even though `previous` was already shown.
    pub fn is_more_severe_than(self, previous: Option<AlertTier>) -> bool {
        match previous {
            Some(previous) => self > previous,
            None => true,
        }
    }
}

impl From<AlertTier> for u8 {
    fn from(tier: AlertTier) -> Self {
        tier.minutes()
    }
}

impl TryFrom<u8> for AlertTier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            15 => Ok(AlertTier::Fifteen),
            10 => Ok(AlertTier::Ten),
            5 => Ok(AlertTier::Five),
            other => Err(format!("unknown alert tier: {}", other)),
        }
    }
}

impl fmt::Display for AlertTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.minutes())
    }
}

/// Lifecycle of a play-session timer. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Active,
    Alert,
    Expired,
}

impl TimerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TimerStatus::Active => "active",
            TimerStatus::Alert => "alert",
            TimerStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(TimerStatus::Active),
            "alert" => Some(TimerStatus::Alert),
            "expired" => Some(TimerStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerView {
    pub id: String,
    pub child_name: String,
    pub remaining_seconds: i64,
    pub status: TimerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_tier: Option<AlertTier>,
}

/// Messages pushed from the daemon to every connected display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TimersUpdate {
        timers: Vec<TimerView>,
    },
    TimerAlert {
        timer_id: String,
        tier: AlertTier,
        remaining_minutes: i64,
        child_name: String,
    },
    TimerExpired {
        timer_id: String,
        child_name: String,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::TimersUpdate { .. } => "timers_update",
            ServerMessage::TimerAlert { .. } => "timer_alert",
            ServerMessage::TimerExpired { .. } => "timer_expired",
        }
    }
}

pub fn parse_server_message(text: &str) -> Result<ServerMessage, ErrorInfo> {
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(ErrorInfo::new(
            "message_too_large",
            "message exceeded maximum size",
        ));
    }
    serde_json::from_str(text).map_err(|err| {
        ErrorInfo::new(
            "invalid_message",
            format!("message was not a valid server message: {}", err),
        )
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::error_with_info(ErrorInfo::new(code, message))
    }

    pub fn error_with_info(error: ErrorInfo) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Body of `POST /timers`, sent by the sales component once a timed sale completes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTimerRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub child_name: String,
    #[serde(default)]
    pub child_age: Option<u8>,
    pub duration_minutes: u32,
    /// RFC3339; defaults to the time the daemon receives the request.
    #[serde(default)]
    pub start_at: Option<String>,
}

impl CreateTimerRequest {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(ErrorInfo::new("invalid_timer_id", "id must not be blank"));
            }
            if id.len() > MAX_TIMER_ID_LEN {
                return Err(ErrorInfo::new(
                    "invalid_timer_id",
                    format!("id must be {} characters or fewer", MAX_TIMER_ID_LEN),
                ));
            }
        }

        if self.child_name.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "child_name is required"));
        }
        if self.child_name.chars().count() > MAX_CHILD_NAME_LEN {
            return Err(ErrorInfo::new(
                "invalid_child_name",
                format!(
                    "child_name must be {} characters or fewer",
                    MAX_CHILD_NAME_LEN
                ),
            ));
        }

        require_minutes(self.duration_minutes, "duration_minutes")?;

        if let Some(start_at) = &self.start_at {
            if DateTime::parse_from_rfc3339(start_at).is_err() {
                return Err(ErrorInfo::new(
                    "invalid_timestamp",
                    "start_at must be RFC3339",
                ));
            }
        }

        Ok(())
    }
}

/// Body of `POST /timers/{id}/extend`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExtendTimerRequest {
    pub minutes: u32,
}

impl ExtendTimerRequest {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_minutes(self.minutes, "minutes")
    }
}

pub fn parse_create_timer(params: Value) -> Result<CreateTimerRequest, ErrorInfo> {
    let request: CreateTimerRequest = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("timer payload is invalid: {}", err),
        )
    })?;
    request.validate()?;
    Ok(request)
}

pub fn parse_extend_timer(params: Value) -> Result<ExtendTimerRequest, ErrorInfo> {
    let request: ExtendTimerRequest = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("extension payload is invalid: {}", err),
        )
    })?;
    request.validate()?;
    Ok(request)
}

fn require_minutes(value: u32, field: &str) -> Result<(), ErrorInfo> {
    if value == 0 {
        return Err(ErrorInfo::new(
            "invalid_minutes",
            format!("{} must be greater than zero", field),
        ));
    }
    if value > MAX_DURATION_MINUTES {
        return Err(ErrorInfo::new(
            "invalid_minutes",
            format!("{} must be {} or fewer", field, MAX_DURATION_MINUTES),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_create() -> CreateTimerRequest {
        CreateTimerRequest {
            id: None,
            child_name: "Mia".to_string(),
            child_age: Some(6),
            duration_minutes: 60,
            start_at: None,
        }
    }

    #[test]
    fn tiers_order_by_severity() {
        assert!(AlertTier::Five > AlertTier::Ten);
        assert!(AlertTier::Ten > AlertTier::Fifteen);
        assert!(AlertTier::Ten.is_more_severe_than(Some(AlertTier::Fifteen)));
        assert!(!AlertTier::Fifteen.is_more_severe_than(Some(AlertTier::Fifteen)));
        assert!(!AlertTier::Ten.is_more_severe_than(Some(AlertTier::Five)));
        assert!(AlertTier::Fifteen.is_more_severe_than(None));
    }

    #[test]
    fn status_orders_forward() {
        assert!(TimerStatus::Active < TimerStatus::Alert);
        assert!(TimerStatus::Alert < TimerStatus::Expired);
        assert_eq!(TimerStatus::parse("alert"), Some(TimerStatus::Alert));
        assert_eq!(TimerStatus::parse("paused"), None);
    }

    #[test]
    fn timer_alert_uses_numeric_tier() {
        let message = ServerMessage::TimerAlert {
            timer_id: "tmr-1".to_string(),
            tier: AlertTier::Ten,
            remaining_minutes: 10,
            child_name: "Mia".to_string(),
        };
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["type"], "timer_alert");
        assert_eq!(value["tier"], 10);
        assert_eq!(value["remaining_minutes"], 10);
    }

    #[test]
    fn parses_timers_update_without_tier() {
        let text = r#"{"type":"timers_update","timers":[
            {"id":"tmr-1","child_name":"Leo","remaining_seconds":870,"status":"alert"}
        ]}"#;
        let message = parse_server_message(text).expect("parse");
        match message {
            ServerMessage::TimersUpdate { timers } => {
                assert_eq!(timers.len(), 1);
                assert_eq!(timers[0].status, TimerStatus::Alert);
                assert_eq!(timers[0].alert_tier, None);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_tier() {
        let text = r#"{"type":"timer_alert","timer_id":"t","tier":7,"remaining_minutes":7,"child_name":"Leo"}"#;
        let err = parse_server_message(text).expect_err("tier 7 is not a tier");
        assert_eq!(err.code, "invalid_message");
    }

    #[test]
    fn validates_create_request() {
        assert!(base_create().validate().is_ok());
    }

    #[test]
    fn create_rejects_zero_duration() {
        let mut request = base_create();
        request.duration_minutes = 0;
        assert_eq!(request.validate().unwrap_err().code, "invalid_minutes");
    }

    #[test]
    fn create_rejects_blank_child_name() {
        let mut request = base_create();
        request.child_name = "  ".to_string();
        assert_eq!(request.validate().unwrap_err().code, "missing_field");
    }

    #[test]
    fn create_rejects_bad_start_timestamp() {
        let mut request = base_create();
        request.start_at = Some("yesterday".to_string());
        assert_eq!(request.validate().unwrap_err().code, "invalid_timestamp");
    }

    #[test]
    fn create_rejects_long_id() {
        let mut request = base_create();
        request.id = Some("a".repeat(256));
        assert!(request.validate().is_err());
    }

    #[test]
    fn parse_create_rejects_unknown_fields() {
        let params = serde_json::json!({
            "child_name": "Mia",
            "duration_minutes": 30,
            "price": 12
        });
        assert_eq!(parse_create_timer(params).unwrap_err().code, "invalid_params");
    }

    #[test]
    fn parse_extend_requires_positive_minutes() {
        let err = parse_extend_timer(serde_json::json!({"minutes": 0})).unwrap_err();
        assert_eq!(err.code, "invalid_minutes");
        assert!(parse_extend_timer(serde_json::json!({"minutes": 15})).is_ok());
    }
}
