//! Prometheus metrics for the composer.

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Install the Prometheus recorder and return its render handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "trx_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "trx_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "trx_http_requests_in_flight";

    // Dispatch
    pub const SUBTASKS_ENQUEUED_TOTAL: &str = "trx_subtasks_enqueued_total";
    pub const SUBTASKS_DISPATCHED_TOTAL: &str = "trx_subtasks_dispatched_total";
    pub const SUBTASKS_SKIPPED_TOTAL: &str = "trx_subtasks_skipped_total";

    // Lifecycle
    pub const TASKS_SUBMITTED_TOTAL: &str = "trx_tasks_submitted_total";
    pub const TASKS_ADMITTED_TOTAL: &str = "trx_tasks_admitted_total";
    pub const TASKS_CLAIMED_TOTAL: &str = "trx_tasks_claimed_total";
    pub const TASKS_COMPLETED_TOTAL: &str = "trx_tasks_completed_total";
    pub const TASKS_FAILED_TOTAL: &str = "trx_tasks_failed_total";
    pub const TASKS_CANCELED_TOTAL: &str = "trx_tasks_canceled_total";

    // Fan-in
    pub const COMPLETIONS_TOTAL: &str = "trx_completions_total";
    pub const CHUNK_OVERFLOWS_TOTAL: &str = "trx_chunk_overflows_total";

    pub const PHASE_DURATION_SECONDS: &str = "trx_phase_duration_seconds";
    pub const ROUTING_BACKLOG_TASKS: &str = "trx_routing_backlog_tasks";
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_enqueued(routing: &str, count: usize) {
    let labels = [("routing", routing.to_string())];
    counter!(names::SUBTASKS_ENQUEUED_TOTAL, &labels).increment(count as u64);
}

pub fn record_dispatched(routing: &str) {
    let labels = [("routing", routing.to_string())];
    counter!(names::SUBTASKS_DISPATCHED_TOTAL, &labels).increment(1);
}

pub fn record_skipped(routing: &str) {
    let labels = [("routing", routing.to_string())];
    counter!(names::SUBTASKS_SKIPPED_TOTAL, &labels).increment(1);
}

pub fn record_submitted() {
    counter!(names::TASKS_SUBMITTED_TOTAL).increment(1);
}

pub fn record_admitted(routing: &str) {
    let labels = [("routing", routing.to_string())];
    counter!(names::TASKS_ADMITTED_TOTAL, &labels).increment(1);
}

pub fn record_claimed(phase: &str) {
    let labels = [("phase", phase.to_string())];
    counter!(names::TASKS_CLAIMED_TOTAL, &labels).increment(1);
}

pub fn record_completed() {
    counter!(names::TASKS_COMPLETED_TOTAL).increment(1);
}

pub fn record_failed(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!(names::TASKS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_canceled() {
    counter!(names::TASKS_CANCELED_TOTAL).increment(1);
}

pub fn record_completion(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    counter!(names::COMPLETIONS_TOTAL, &labels).increment(1);
}

pub fn record_overflow() {
    counter!(names::CHUNK_OVERFLOWS_TOTAL).increment(1);
}

pub fn record_phase_duration(phase: &str, duration_secs: f64) {
    let labels = [("phase", phase.to_string())];
    histogram!(names::PHASE_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn set_routing_backlog(routing: &str, tasks: i64) {
    let labels = [("routing", routing.to_string())];
    gauge!(names::ROUTING_BACKLOG_TASKS, &labels).set(tasks as f64);
}

/// Metrics middleware for HTTP requests.
///
/// Labels use the matched route template, so task IDs never become labels.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
    let response = next.run(request).await;
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    record_http_request(&method, &path, response.status().as_u16(), start.elapsed().as_secs_f64());
    response
}
