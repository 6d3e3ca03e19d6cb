//! API route definitions.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{Extensions, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::runner::RunError;
use crate::scheduler::{ScheduleConfig, ScheduleError};
use crate::service::RequestContext;
use crate::storage::StoreError;

const DEFAULT_RESULTS_LIMIT: usize = 10;
const MAX_RESULTS_LIMIT: usize = 1000;
const DEFAULT_SERVERS_LIMIT: usize = 10;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/speedtest", post(run_speedtest))
        .route("/results", get(list_results))
        .route("/schedule", get(get_schedule).put(put_schedule))
        .route("/lock", get(lock_status))
        .route("/servers", get(list_servers))
}

/// Error body: `{"error": {"code", "message", ...}}`.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    remaining_secs: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            remaining_secs: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({ "code": self.code, "message": self.message });
        if let Some(secs) = self.remaining_secs {
            error["remaining_secs"] = json!(secs);
        }
        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "state store error");
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string())
    }
}

impl From<RunError> for ApiError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::Busy => ApiError::new(StatusCode::CONFLICT, "busy", e.to_string()),
            RunError::CooldownActive { remaining_secs } => ApiError {
                remaining_secs: Some(remaining_secs),
                ..ApiError::new(StatusCode::TOO_MANY_REQUESTS, "cooldown", e.to_string())
            },
            RunError::ProbeFailed { .. } => {
                ApiError::new(StatusCode::BAD_GATEWAY, "probe_failed", e.to_string())
            }
            RunError::ParseFailed { .. } => {
                ApiError::new(StatusCode::BAD_GATEWAY, "parse_failed", e.to_string())
            }
            RunError::Store(e) => e.into(),
            RunError::Worker(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "worker_failed", e.to_string())
            }
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::InvalidInterval { .. } => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_interval", e.to_string())
            }
            ScheduleError::Unauthorized => {
                ApiError::new(StatusCode::FORBIDDEN, "unauthorized", e.to_string())
            }
            ScheduleError::AlreadyArmed => {
                ApiError::new(StatusCode::CONFLICT, "already_armed", e.to_string())
            }
            ScheduleError::Store(e) => e.into(),
        }
    }
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
struct RunParams {
    server_id: Option<u32>,
}

async fn run_speedtest(
    State(state): State<AppState>,
    Query(params): Query<RunParams>,
) -> Result<Json<Value>, ApiError> {
    let record = state.service.trigger_manual(params.server_id).await?;
    Ok(Json(json!({ "data": record, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

async fn list_results(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RESULTS_LIMIT)
        .min(MAX_RESULTS_LIMIT);
    let records = state.service.recent_results(limit)?;
    let total = records.len();
    Ok(Json(json!({
        "data": records,
        "meta": { "total": total, "limit": limit }
    })))
}

async fn get_schedule(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.service.schedule().await, "meta": meta() }))
}

async fn put_schedule(
    State(state): State<AppState>,
    extensions: Extensions,
    Json(cfg): Json<ScheduleConfig>,
) -> Result<Json<Value>, ApiError> {
    let ctx = RequestContext {
        client_addr: extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip()),
    };
    let status = state.service.set_schedule(&ctx, cfg).await?;
    Ok(Json(json!({ "data": status, "meta": meta() })))
}

async fn lock_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let lock = state.service.lock_status()?;
    let cooldown = state.service.cooldown_status()?;
    Ok(Json(json!({
        "data": { "lock": lock, "cooldown": cooldown },
        "meta": meta()
    })))
}

async fn list_servers(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Json<Value> {
    let list = state
        .service
        .servers(params.limit.unwrap_or(DEFAULT_SERVERS_LIMIT))
        .await;
    let total = list.servers.len();
    Json(json!({
        "data": list.servers,
        "meta": { "total": total, "error": list.error }
    }))
}
