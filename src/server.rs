//! HTTP service for the log store.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/logs` | Append a log record (idempotent, triple-sink) |
//! | `GET`  | `/logs` | Recent records |
//! | `GET`  | `/kpi` | Daily KPI rows (JSON) |
//! | `GET`  | `/kpi/export.csv` | Daily KPI rows (streamed CSV) |
//! | `POST` | `/hvdc/transform` | Queue an async rollup run (202 + job_id) |
//! | `GET`  | `/hvdc/jobs/{job_id}` | Job status |
//! | `POST` | `/hvdc/run` | Synchronous rollup run |
//! | `GET`  | `/health` | Liveness + store overview |
//! | `GET`  | `/metrics` | Basic counters |
//!
//! # Error Contract
//!
//! Every error body is `{ "status": "error", "message": "..." }`:
//! 401 auth, 400 validation, 404 unknown job, 409 duplicate id,
//! 500 storage/pipeline failure.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth;
use crate::config::Config;
use crate::idempotency;
use crate::jobs;
use crate::kpi::{self, KpiFilter};
use crate::models::{AppendLogRequest, LogRecord};
use crate::pipeline::{PipelineError, PipelineRunner};
use crate::store::{LogStore, StoreError};

const API_KEY_HEADER: &str = "x-api-key";
const SIGNATURE_HEADER: &str = "x-signature-256";
const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Shared application state handed to every route handler. Built once at
/// startup; nothing in here is a process global.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<LogStore>,
    runner: Arc<dyn PipelineRunner>,
    /// Last debounced rollup launch; requests inside the window are dropped.
    last_rollup: Arc<Mutex<Option<Instant>>>,
    /// Serializes pipeline runs; DuckDB is single-writer.
    pipeline_lock: Arc<Mutex<()>>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, store: Arc<LogStore>, runner: Arc<dyn PipelineRunner>) -> Self {
        Self {
            config,
            store,
            runner,
            last_rollup: Arc::new(Mutex::new(None)),
            pipeline_lock: Arc::new(Mutex::new(())),
            started_at: Instant::now(),
        }
    }
}

/// Starts the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(
    config: Arc<Config>,
    store: Arc<LogStore>,
    runner: Arc<dyn PipelineRunner>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState::new(config, store, runner);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    info!("log store listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Route table, separated from `run_server` so tests can drive the app
/// state directly.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/logs", post(handle_append_log).get(handle_recent_logs))
        .route("/kpi", get(handle_kpi))
        .route("/kpi/export.csv", get(handle_kpi_export))
        .route("/hvdc/transform", post(handle_transform))
        .route("/hvdc/jobs/{job_id}", get(handle_job_status))
        .route("/hvdc/run", post(handle_run_sync))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ============ Error envelope ============

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            status: "error",
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: message.into(),
    }
}

fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let supplied = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if !auth::check_api_key(&state.config.auth.api_key, supplied) {
        return Err(unauthorized("Unauthorized"));
    }
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Replay a stored idempotent response byte for byte.
fn replay(status: StatusCode, stored: String) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(stored))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ============ POST /logs ============

async fn handle_append_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    require_api_key(&state, &headers)?;

    let payload: AppendLogRequest = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("invalid request body: {}", e)))?;

    // Idempotency lookup short-circuits everything, including re-writes.
    let idem_key = idempotency::resolve_key(
        header_str(&headers, IDEMPOTENCY_HEADER),
        payload.request_id.as_deref(),
    );
    if let Some(stored) = idempotency::lookup(state.store.pool(), &idem_key)
        .await
        .map_err(|e| internal(e.to_string()))?
    {
        return Ok(replay(StatusCode::OK, stored));
    }

    let signature = header_str(&headers, SIGNATURE_HEADER).or(payload.signature.as_deref());
    if !auth::verify_signature(&state.config.auth.hmac_secret, &body, signature) {
        return Err(unauthorized("Invalid signature"));
    }

    payload.validate().map_err(bad_request)?;

    let assigned_id = payload
        .request_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let record = LogRecord::from_request(&payload, assigned_id);

    match state.store.append(&record).await {
        Ok(()) => {}
        Err(StoreError::Duplicate(id)) => {
            return Err(conflict(format!("duplicate record id: {}", id)))
        }
        Err(e @ StoreError::Sink { .. }) => return Err(internal(e.to_string())),
    }

    let triggered = maybe_trigger_rollup(&state).await;

    let response = serde_json::json!({
        "status": "ok",
        "idempotency_key": idem_key,
        "attempt": 1,
        "priority": "FYI",
        "sla_breach": record.sla_breaches,
        "message": "Stored in local CSV/SQLite + bronze JSONL",
        "pipeline_triggered": triggered,
    })
    .to_string();

    idempotency::store(
        state.store.pool(),
        &idem_key,
        &response,
        state.config.idempotency.retention_days,
    )
    .await
    .map_err(|e| internal(e.to_string()))?;

    Ok(replay(StatusCode::OK, response))
}

/// Launch a background rollup unless one was launched inside the debounce
/// window. Skipped triggers are dropped, not queued.
async fn maybe_trigger_rollup(state: &AppState) -> bool {
    let window = Duration::from_secs(state.config.server.debounce_secs);
    let mut last = state.last_rollup.lock().await;
    let now = Instant::now();
    if let Some(prev) = *last {
        if now.duration_since(prev) < window {
            return false;
        }
    }

    // The window only advances once a job row actually exists; a failed
    // create leaves the next request free to retry.
    let job_id = Uuid::new_v4().to_string();
    if let Err(e) = jobs::create(state.store.pool(), &job_id).await {
        warn!("failed to create debounced rollup job: {}", e);
        return false;
    }
    *last = Some(now);
    drop(last);

    let state = state.clone();
    tokio::spawn(async move {
        run_pipeline_job(&state, &job_id).await;
    });
    true
}

/// Drive one tracked pipeline run to a terminal state, enforcing the
/// wall-clock budget.
async fn run_pipeline_job(state: &AppState, job_id: &str) -> Option<serde_json::Value> {
    let pool = state.store.pool();
    if let Err(e) = jobs::mark_running(pool, job_id).await {
        warn!("job {}: failed to mark running: {}", job_id, e);
        return None;
    }

    let runner = state.runner.clone();
    let budget = Duration::from_secs(state.config.server.pipeline_timeout_secs);
    let _run_guard = state.pipeline_lock.lock().await;
    let outcome = tokio::time::timeout(budget, tokio::task::spawn_blocking(move || runner.run()))
        .await;

    match outcome {
        Ok(Ok(Ok(report))) => {
            let summary = serde_json::to_value(&report).unwrap_or_default();
            if let Err(e) = jobs::mark_succeeded(pool, job_id, &summary).await {
                warn!("job {}: failed to mark succeeded: {}", job_id, e);
            }
            info!(
                "rollup job {} succeeded: {} silver rows",
                job_id, report.silver_rows
            );
            Some(summary)
        }
        Ok(Ok(Err(err))) => {
            let error = pipeline_error_json(&err);
            if let Err(e) = jobs::mark_failed(pool, job_id, &error).await {
                warn!("job {}: failed to mark failed: {}", job_id, e);
            }
            warn!("rollup job {} failed: {}", job_id, err);
            None
        }
        Ok(Err(join_err)) => {
            let error = serde_json::json!({ "message": join_err.to_string() });
            let _ = jobs::mark_failed(pool, job_id, &error).await;
            warn!("rollup job {} panicked: {}", job_id, join_err);
            None
        }
        Err(_elapsed) => {
            let error = serde_json::json!({
                "message": "timeout",
                "detail": format!("pipeline exceeded {}s budget", budget.as_secs()),
            });
            let _ = jobs::mark_failed(pool, job_id, &error).await;
            warn!("rollup job {} timed out", job_id);
            None
        }
    }
}

fn pipeline_error_json(err: &PipelineError) -> serde_json::Value {
    serde_json::json!({ "message": err.to_string() })
}

// ============ GET /logs ============

#[derive(Deserialize)]
struct RecentLogsQuery {
    limit: Option<i64>,
    since: Option<String>,
    group_name: Option<String>,
}

async fn handle_recent_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RecentLogsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_api_key(&state, &headers)?;

    let limit = query.limit.unwrap_or(10).clamp(1, 200);
    let rows = state
        .store
        .recent(limit, query.since.as_deref(), query.group_name.as_deref())
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "rows": rows,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

// ============ GET /kpi ============

#[derive(Deserialize)]
struct KpiQuery {
    since: Option<String>,
    until: Option<String>,
    group_name: Option<String>,
}

impl From<KpiQuery> for KpiFilter {
    fn from(q: KpiQuery) -> Self {
        KpiFilter {
            since: q.since,
            until: q.until,
            group_name: q.group_name,
        }
    }
}

async fn handle_kpi(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<KpiQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_api_key(&state, &headers)?;

    let filter: KpiFilter = query.into();
    let rows = kpi::query_kpi(state.store.storage(), state.store.pool(), &filter)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(kpi::rows_to_json(&rows, &filter)))
}

// ============ GET /kpi/export.csv ============

/// Adapts the export channel to a body stream (chunks arrive as rows are
/// produced, not after the full query completes).
struct CsvExportStream {
    rx: mpsc::Receiver<String>,
}

impl Stream for CsvExportStream {
    type Item = Result<String, std::convert::Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

async fn handle_kpi_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<KpiQuery>,
) -> Result<Response, AppError> {
    require_api_key(&state, &headers)?;

    let rx = kpi::spawn_csv_export(
        state.store.storage().clone(),
        state.store.pool().clone(),
        query.into(),
    );
    let body = Body::from_stream(CsvExportStream { rx });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/csv")
        .body(body)
        .map_err(|e| internal(e.to_string()))
}

// ============ POST /hvdc/transform ============

async fn handle_transform(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_api_key(&state, &headers)?;

    // Same idempotency ledger as /logs: an accepted transform replays the
    // original 202 instead of spawning a second job.
    let idem_key = idempotency::resolve_key(header_str(&headers, IDEMPOTENCY_HEADER), None);
    if let Some(stored) = idempotency::lookup(state.store.pool(), &idem_key)
        .await
        .map_err(|e| internal(e.to_string()))?
    {
        return Ok(replay(StatusCode::ACCEPTED, stored));
    }

    let job_id = Uuid::new_v4().to_string();
    jobs::create(state.store.pool(), &job_id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    let worker_state = state.clone();
    let worker_job_id = job_id.clone();
    tokio::spawn(async move {
        run_pipeline_job(&worker_state, &worker_job_id).await;
    });

    let response = serde_json::json!({
        "status": "accepted",
        "job_id": job_id,
        "queued_at": chrono::Utc::now().to_rfc3339(),
    })
    .to_string();

    idempotency::store(
        state.store.pool(),
        &idem_key,
        &response,
        state.config.idempotency.retention_days,
    )
    .await
    .map_err(|e| internal(e.to_string()))?;

    Ok(replay(StatusCode::ACCEPTED, response))
}

// ============ GET /hvdc/jobs/{job_id} ============

async fn handle_job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_api_key(&state, &headers)?;

    let job = jobs::get(state.store.pool(), &job_id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found(format!("unknown job: {}", job_id)))?;

    Ok(Json(serde_json::to_value(&job).map_err(|e| internal(e.to_string()))?))
}

// ============ POST /hvdc/run ============

async fn handle_run_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_api_key(&state, &headers)?;

    let job_id = Uuid::new_v4().to_string();
    jobs::create(state.store.pool(), &job_id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    match run_pipeline_job(&state, &job_id).await {
        Some(summary) => Ok(Json(serde_json::json!({
            "status": "ok",
            "job_id": job_id,
            "result_summary": summary,
        }))),
        None => {
            let job = jobs::get(state.store.pool(), &job_id)
                .await
                .ok()
                .flatten();
            let message = job
                .and_then(|j| j.error)
                .map(|e| e.to_string())
                .unwrap_or_else(|| "pipeline failed".to_string());
            Err(internal(message))
        }
    }
}

// ============ GET /health, GET /metrics ============

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let processed = state.store.record_count().await.unwrap_or(0);
    let queue_depth = jobs::queue_depth(state.store.pool()).await.unwrap_or(0);

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "processed": processed,
        "queue_depth": queue_depth,
        "duckdb_connected": kpi::duckdb_available(state.store.storage()),
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn handle_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_api_key(&state, &headers)?;

    let processed = state.store.record_count().await.unwrap_or(0);
    let queue_depth = jobs::queue_depth(state.store.pool()).await.unwrap_or(0);

    Ok(Json(serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "processed": processed,
        "queue_depth": queue_depth,
        "duckdb_connected": kpi::duckdb_available(state.store.storage()),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}
