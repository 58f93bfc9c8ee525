//! Worker error types.

use thiserror::Error;
use trx_media::MediaError;
use trx_models::{ErrorCode, ErrorDomain, TaskError};

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The composer is down or shedding load; back off and retry later.
    #[error("Composer unavailable: {0}")]
    Unavailable(String),

    /// The task was canceled or its scratch dir is gone.
    #[error("Task gone")]
    TaskGone,

    #[error("Cancelled")]
    Cancelled,

    #[error("Composer rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn download_failed(msg: impl Into<String>) -> Self {
        Self::DownloadFailed(msg.into())
    }

    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::UploadFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            WorkerError::Cancelled => true,
            WorkerError::Media(e) => e.is_cancelled(),
            _ => false,
        }
    }

    /// Worth another attempt against the same endpoint.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Unavailable(_) => true,
            WorkerError::Http(e) => e.is_connect() || e.is_timeout(),
            WorkerError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Structured error reported to the composer for a failed subtask.
    pub fn to_task_error(&self) -> TaskError {
        match self {
            WorkerError::Media(e) => e.to_task_error(ErrorCode::FfmpegError, ErrorDomain::Encoder),
            WorkerError::DownloadFailed(msg) => {
                TaskError::new(ErrorCode::NetworkError, ErrorDomain::Transcoder).with_meta("err", msg)
            }
            WorkerError::UploadFailed(msg) => {
                TaskError::new(ErrorCode::UploadError, ErrorDomain::Transcoder).with_meta("err", msg)
            }
            WorkerError::Http(e) => {
                TaskError::new(ErrorCode::NetworkError, ErrorDomain::Transcoder).with_meta("err", e)
            }
            other => TaskError::unknown(ErrorDomain::Transcoder, other),
        }
    }
}
