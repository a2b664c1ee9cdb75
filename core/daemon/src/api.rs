//! HTTP surface: health, timer reads, and the collaborator entry points
//! (`POST /timers` from sales, `POST /timers/{id}/extend` from extensions).

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use playtime_daemon_protocol::{
    parse_create_timer, parse_extend_timer, ErrorInfo, Response, TimerView, PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::state::SharedState;
use crate::timer::NewTimer;
use crate::ws;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/timers", get(list_timers).post(create_timer))
        .route("/timers/{id}", get(get_timer))
        .route("/timers/{id}/extend", post(extend_timer))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

pub struct ApiError {
    status: StatusCode,
    info: ErrorInfo,
}

impl ApiError {
    fn bad_request(info: ErrorInfo) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            info,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists(_) | StoreError::Expired(_) => StatusCode::CONFLICT,
            StoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            StoreError::Sqlite { .. } | StoreError::Io { .. } | StoreError::Corrupt { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            info: ErrorInfo::new(err.code(), err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        (self.status, Json(Response::error_with_info(self.info))).into_response()
    }
}

type ApiResult = Result<HttpResponse, ApiError>;

fn ok(status: StatusCode, data: impl Serialize) -> ApiResult {
    let value = serde_json::to_value(data).map_err(|err| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        info: ErrorInfo::new(
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        ),
    })?;
    Ok((status, Json(Response::ok(value))).into_response())
}

fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ApiError::bad_request(ErrorInfo::new(
            "empty_request",
            "request body was empty",
        )));
    }
    serde_json::from_slice(body).map_err(|err| {
        ApiError::bad_request(ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        ))
    })
}

async fn health(State(state): State<SharedState>) -> ApiResult {
    let data = serde_json::json!({
        "status": "ok",
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "evaluator_interval_secs": state.config.evaluator.interval_secs,
        "connections": state.connections.len(),
        "open_connections": state.connections.open_count(),
        "displays": state.connections.snapshot_info(),
        "evaluator": state.stats.snapshot(),
    });
    ok(StatusCode::OK, data)
}

async fn list_timers(State(state): State<SharedState>) -> ApiResult {
    let grace = state.config.evaluator.expired_grace();
    let now = Utc::now();
    let timers = state
        .with_store(move |store| store.list_visible(now, grace))
        .await?;
    let views: Vec<TimerView> = timers.iter().map(|timer| timer.view(now)).collect();
    debug!(timers = views.len(), "Timer list");
    ok(StatusCode::OK, views)
}

async fn get_timer(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let lookup = id.clone();
    match state.with_store(move |store| store.get(&lookup)).await? {
        Some(timer) => ok(StatusCode::OK, timer),
        None => Err(StoreError::NotFound(id).into()),
    }
}

async fn create_timer(State(state): State<SharedState>, body: Bytes) -> ApiResult {
    let request = parse_create_timer(parse_body(&body)?).map_err(ApiError::bad_request)?;
    let now = Utc::now();
    let new_timer = NewTimer::from_request(request, now);
    let timer = state
        .with_store(move |store| store.create(new_timer, now))
        .await?;

    info!(
        timer_id = %timer.id,
        child_name = %timer.child_name,
        end_at = %timer.end_at.to_rfc3339(),
        "Timer created"
    );
    ok(StatusCode::CREATED, timer)
}

async fn extend_timer(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    let request = parse_extend_timer(parse_body(&body)?).map_err(ApiError::bad_request)?;
    let policy = state.config.evaluator.extension_tier_policy;
    let now = Utc::now();
    let minutes = request.minutes;
    let timer = state
        .with_store(move |store| store.extend(&id, minutes, policy, now))
        .await?;

    info!(
        timer_id = %timer.id,
        minutes,
        extended_minutes = timer.extended_minutes,
        last_alert_tier = ?timer.last_alert_tier,
        "Timer extended"
    );
    ok(StatusCode::OK, timer)
}
