//! Composer error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use trx_media::MediaError;
use trx_models::{ErrorCode, ErrorDomain, TaskError};
use trx_queue::QueueError;
use trx_store::StoreError;

pub type ComposerResult<T> = Result<T, ComposerError>;

/// Failures inside the coordinator's phases and services.
#[derive(Debug, Error)]
pub enum ComposerError {
    /// The task was canceled or deleted while a phase held it
    #[error("Task canceled")]
    Canceled,

    #[error("{0}")]
    Task(TaskError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ComposerError {
    /// Wrap a media failure of a named step.
    pub fn media_step(err: MediaError, code: ErrorCode, domain: ErrorDomain) -> Self {
        if err.is_cancelled() {
            Self::Canceled
        } else {
            Self::Task(err.to_task_error(code, domain))
        }
    }

    pub fn validation(domain: ErrorDomain, message: impl std::fmt::Display) -> Self {
        Self::Task(TaskError::validation(domain, message))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ComposerError::Canceled)
    }

    /// Structured form persisted with the failed task.
    pub fn to_task_error(&self, domain: ErrorDomain) -> TaskError {
        match self {
            ComposerError::Task(e) => e.clone(),
            ComposerError::Store(e) => TaskError::db(domain, e),
            ComposerError::Queue(e) => TaskError::redis(domain, e),
            ComposerError::Http(e) => TaskError::new(ErrorCode::NetworkError, domain).with_meta("err", e),
            ComposerError::Media(e) => e.to_task_error(ErrorCode::GenericError, domain),
            other => TaskError::unknown(domain, other),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Task was canceled, failed or deleted; the upload is no longer wanted
    #[error("Gone: {0}")]
    Gone(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl ToString) -> Self {
        Self::BadRequest(msg.to_string())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn gone(msg: impl Into<String>) -> Self {
        Self::Gone(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::NotFound(format!("task {id}")),
            StoreError::Database(e) => ApiError::Unavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Unavailable(err.to_string())
    }
}

impl From<ComposerError> for ApiError {
    fn from(err: ComposerError) -> Self {
        match err {
            ComposerError::Store(e) => e.into(),
            ComposerError::Queue(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
