//! Internal worker RPC: dispatch, progress and completion reports.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::debug;
use trx_models::{CompletionOutcome, CompletionReport, DispatchResponse, NextSubtaskRequest, ProgressReport};
use trx_queue::Dequeued;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ProgressAck {
    pub progress: i64,
}

/// POST /internal/v1/dispatch/next
///
/// Blocks for at most the dequeue timeout. A store outage surfaces as 503
/// so workers back off.
pub async fn next_subtask(
    State(state): State<AppState>,
    Json(request): Json<NextSubtaskRequest>,
) -> ApiResult<Json<DispatchResponse>> {
    if request.routing.is_empty() {
        return Err(ApiError::bad_request("routing must not be empty"));
    }

    let response = match state.dispatch.dequeue(&request.routing).await? {
        Dequeued::Subtask(subtask) => {
            debug!(
                task_id = %subtask.task_id,
                part = subtask.part,
                worker = %request.worker_id,
                host = %request.hostname,
                "Dispatching subtask"
            );
            metrics::record_dispatched(&request.routing);
            DispatchResponse::Subtask {
                subtask: Box::new(subtask),
            }
        }
        Dequeued::Skip => {
            metrics::record_skipped(&request.routing);
            DispatchResponse::Skip
        }
        Dequeued::NoTasks => DispatchResponse::NoTasks,
    };

    Ok(Json(response))
}

/// POST /internal/v1/progress
pub async fn report_progress(
    State(state): State<AppState>,
    Json(report): Json<ProgressReport>,
) -> ApiResult<Json<ProgressAck>> {
    let progress = state.progress.report(&report).await?;
    Ok(Json(ProgressAck { progress }))
}

/// POST /internal/v1/completions
pub async fn report_completion(
    State(state): State<AppState>,
    Json(report): Json<CompletionReport>,
) -> ApiResult<Json<CompletionOutcome>> {
    if report.parts_total == 0 || report.part >= report.parts_total {
        return Err(ApiError::bad_request(format!(
            "part {} out of range for {} parts",
            report.part, report.parts_total
        )));
    }
    let outcome = state.fan_in.report(&report).await?;
    Ok(Json(outcome))
}
