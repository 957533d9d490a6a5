//! HTTP router construction.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api;
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/tasks", post(api::submit_task).get(api::list_tasks))
        .route("/tasks/{id}", get(api::get_task))
        .route("/tasks/{id}/status", get(api::task_status))
        .route("/tasks/{id}/cancel", post(api::cancel_task))
        .route("/tasks/{id}/retry", post(api::retry_task))
        .route("/queue/status", get(api::queue_status))
        .route("/workers", get(api::workers))
        .route("/metrics/tasks", get(api::task_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
