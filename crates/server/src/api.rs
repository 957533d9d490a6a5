//! HTTP handlers for the task API.
//!
//! Thin layer over the scheduler: handlers translate between JSON and
//! scheduler calls and map scheduler errors onto status codes. Notably,
//! a full queue answers 503 — backpressure, not a server error.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use dolmetscher_core::{Task, TaskDraft, TaskStatus, WorkerStatus};
use dolmetscher_scheduler::{CancelOutcome, SchedulerError};
use dolmetscher_store::StoreError;

use crate::state::AppState;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

// ── Error mapping ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub(crate) type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

fn error_response(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error: msg.into() }))
}

pub(crate) fn bad_request(msg: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    error_response(StatusCode::BAD_REQUEST, msg)
}

fn scheduler_error(e: SchedulerError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        SchedulerError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::Validation(_) => StatusCode::BAD_REQUEST,
        SchedulerError::IllegalState { .. } | SchedulerError::RetryExhausted { .. } => {
            StatusCode::CONFLICT
        }
        SchedulerError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        SchedulerError::Store(StoreError::Conflict { .. }) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {e}");
    }
    error_response(status, e.to_string())
}

// ── Health ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub workers: usize,
    pub queued: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        workers: state.scheduler.pool().len(),
        queued: state.scheduler.queue_len(),
    })
}

// ── Task submission & inspection ──────────────────────────────────

#[derive(Serialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub status: TaskStatus,
}

pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<TaskDraft>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let task_id = state
        .scheduler
        .submit(draft)
        .await
        .map_err(scheduler_error)?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            task_id,
            status: TaskStatus::Pending,
        }),
    ))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Task>> {
    let task = state
        .scheduler
        .status(&task_id)
        .await
        .map_err(scheduler_error)?;
    Ok(Json(task))
}

/// Flat status string, nothing else. Pollers hit this endpoint hard.
pub async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskStatus>> {
    let task = state
        .scheduler
        .status(&task_id)
        .await
        .map_err(scheduler_error)?;
    Ok(Json(task.status))
}

#[derive(Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<Task>>> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(raw.parse::<TaskStatus>().map_err(bad_request)?),
        None => None,
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let tasks = state
        .scheduler
        .store()
        .list(status, limit, offset)
        .await
        .map_err(|e| scheduler_error(e.into()))?;
    Ok(Json(tasks))
}

// ── Lifecycle operations ──────────────────────────────────────────

#[derive(Serialize)]
pub struct CancelResponse {
    pub task_id: String,
    pub outcome: &'static str,
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let outcome = state
        .scheduler
        .cancel(&task_id)
        .await
        .map_err(scheduler_error)?;
    Ok(Json(CancelResponse {
        task_id,
        outcome: match outcome {
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::CancelRequested => "cancel_requested",
        },
    }))
}

#[derive(Serialize)]
pub struct RetryResponse {
    pub task_id: String,
    pub status: TaskStatus,
}

pub async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<RetryResponse>> {
    state
        .scheduler
        .retry(&task_id)
        .await
        .map_err(scheduler_error)?;
    Ok(Json(RetryResponse {
        task_id,
        status: TaskStatus::Pending,
    }))
}

// ── Queue, workers, metrics ───────────────────────────────────────

#[derive(Serialize)]
pub struct QueueStatusResponse {
    pub queued: usize,
    pub active: i64,
    pub capacity: u64,
    pub is_full: bool,
}

pub async fn queue_status(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<QueueStatusResponse>> {
    let active = state
        .scheduler
        .store()
        .count_active()
        .await
        .map_err(|e| scheduler_error(e.into()))?;
    let capacity = state.scheduler.config().max_queue_size;
    Ok(Json(QueueStatusResponse {
        queued: state.scheduler.queue_len(),
        active,
        capacity,
        is_full: active >= capacity as i64,
    }))
}

#[derive(Serialize)]
pub struct WorkersResponse {
    pub workers: Vec<WorkerStatus>,
    pub busy: Vec<String>,
}

pub async fn workers(State(state): State<Arc<AppState>>) -> ApiResult<Json<WorkersResponse>> {
    let rows = state
        .scheduler
        .store()
        .list_workers()
        .await
        .map_err(|e| scheduler_error(e.into()))?;
    Ok(Json(WorkersResponse {
        workers: rows,
        busy: state.scheduler.pool().busy_workers(),
    }))
}

#[derive(Serialize)]
pub struct TaskMetricsResponse {
    pub by_status: std::collections::HashMap<String, i64>,
    pub queued: usize,
    pub busy_workers: usize,
    pub total_workers: usize,
}

pub async fn task_metrics(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<TaskMetricsResponse>> {
    let by_status = state
        .scheduler
        .store()
        .status_counts()
        .await
        .map_err(|e| scheduler_error(e.into()))?;
    Ok(Json(TaskMetricsResponse {
        by_status,
        queued: state.scheduler.queue_len(),
        busy_workers: state.scheduler.pool().busy_workers().len(),
        total_workers: state.scheduler.pool().len(),
    }))
}
