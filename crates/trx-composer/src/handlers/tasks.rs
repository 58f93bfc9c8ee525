//! Public task API.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::info;
use trx_models::{progress, CreateTaskForm, Task, TaskStatus};
use validator::Validate;

use super::parse_task_id;
use crate::error::{ApiError, ApiResult};
use crate::lifecycle::CancelOutcome;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TaskProgressResponse {
    pub task_id: String,
    pub status: TaskStatus,
    /// Percent, 0..=100
    pub progress: i64,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: String,
    pub status: TaskStatus,
}

/// POST /v1/tasks
pub async fn create_task(
    State(state): State<AppState>,
    Json(form): Json<CreateTaskForm>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    form.validate().map_err(ApiError::bad_request)?;
    let task = state.lifecycle.submit(form).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /v1/tasks/:id
pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Task>> {
    let id = parse_task_id(&id)?;
    let task = state.lifecycle.get(id).await?;
    Ok(Json(task))
}

/// GET /v1/tasks/:id/progress
pub async fn get_task_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskProgressResponse>> {
    let id = parse_task_id(&id)?;
    let task = state.lifecycle.get(id).await?;

    let progress = match task.status {
        TaskStatus::Done => progress::DONE,
        TaskStatus::Pending | TaskStatus::WaitingSplitting => 0,
        _ => state.progress.get(id).await?,
    };

    Ok(Json(TaskProgressResponse {
        task_id: id.to_string(),
        status: task.status,
        progress,
    }))
}

/// POST /v1/tasks/:id/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let id = parse_task_id(&id)?;
    match state.lifecycle.cancel(id).await? {
        CancelOutcome::Canceled => Ok(Json(CancelResponse {
            task_id: id.to_string(),
            status: TaskStatus::Canceled,
        })),
        CancelOutcome::AlreadyFinished(status) => Err(ApiError::conflict(format!("task {id} is already {status}"))),
    }
}

/// DELETE /v1/tasks/:id
pub async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let id = parse_task_id(&id)?;
    state.lifecycle.delete(id).await?;
    info!(task_id = %id, "Task deleted via API");
    Ok(StatusCode::NO_CONTENT)
}
