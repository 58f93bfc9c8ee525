//! Chunk downloads and encoded-part uploads between composer and workers.

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, warn};

use super::parse_task_id;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::workdir::{is_safe_file_name, resolve_servable, ENCODED_DIR};

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub task_id: String,
    /// Relative to the task directory, e.g. `chunks/chunk_003.mp4`
    pub path: String,
}

/// GET /v1/chunks?task_id=&path=
pub async fn get_chunk(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
    request: Request,
) -> ApiResult<Response> {
    let id = parse_task_id(&query.task_id)?;
    if state.lifecycle.meta().is_skipped(&id).await? {
        return Err(ApiError::gone(format!("task {id} is no longer running")));
    }

    let path = resolve_servable(&state.config.task_dir(&id), &query.path)
        .ok_or_else(|| ApiError::bad_request(format!("path not servable: {}", query.path)))?;
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(ApiError::not_found(format!("{} of task {id}", query.path)));
    }

    let response = match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    Ok(response.into_response())
}

/// PUT /v1/tasks/:id/parts/:part/:file
///
/// Streams the body to `encoded/{file}` through a temporary file, so the
/// assembler never sees a partial upload.
pub async fn upload_part(
    State(state): State<AppState>,
    Path((id, part, file)): Path<(String, u32, String)>,
    body: Body,
) -> ApiResult<StatusCode> {
    let id = parse_task_id(&id)?;
    if !is_safe_file_name(&file) {
        return Err(ApiError::bad_request(format!("invalid file name: {file}")));
    }
    if state.lifecycle.meta().is_skipped(&id).await? {
        return Err(ApiError::gone(format!("task {id} is no longer running")));
    }

    let task_dir = state.config.task_dir(&id);
    if !tokio::fs::try_exists(&task_dir).await.unwrap_or(false) {
        return Err(ApiError::gone(format!("task {id} has no work directory")));
    }

    let dir = task_dir.join(ENCODED_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let dst = dir.join(&file);
    let tmp = dir.join(format!(".{file}.partial"));

    let written = match write_stream(body, &tmp).await {
        Ok(written) => written,
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            warn!(task_id = %id, part, file = %file, error = %e, "Upload failed");
            return Err(e);
        }
    };
    tokio::fs::rename(&tmp, &dst)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    debug!(task_id = %id, part, file = %file, bytes = written, "Part uploaded");
    Ok(StatusCode::CREATED)
}

async fn write_stream(body: Body, dst: &std::path::Path) -> ApiResult<u64> {
    let mut file = tokio::fs::File::create(dst)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let mut stream = body.into_data_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ApiError::bad_request(format!("upload interrupted: {e}")))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(written)
}
