//! API routes.

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    cancel_task, create_task, delete_task, get_chunk, get_task, get_task_progress, health, next_subtask, ready,
    report_completion, report_progress, upload_part,
};
use crate::metrics::metrics_middleware;
use crate::middleware::{request_id, request_logging};
use crate::state::AppState;

/// Create the composer router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let task_routes = Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks/:task_id", get(get_task).delete(delete_task))
        .route("/tasks/:task_id/progress", get(get_task_progress))
        .route("/tasks/:task_id/cancel", post(cancel_task));

    // Worker-facing file transfer
    let file_routes = Router::new()
        .route("/chunks", get(get_chunk))
        .route("/tasks/:task_id/parts/:part/:file", put(upload_part));

    let internal_routes = Router::new()
        .route("/dispatch/next", post(next_subtask))
        .route("/progress", post(report_progress))
        .route("/completions", post(report_completion));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/v1", task_routes.merge(file_routes))
        .nest("/internal/v1", internal_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
