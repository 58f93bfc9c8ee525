//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;
use trx_models::{ErrorCode, ErrorDomain, TaskError};

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during media processing.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("FFmpeg command failed [{code}]: {message}")]
    FfmpegFailed {
        /// Classified failure code, e.g. `CORRUPT_INPUT`
        code: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid media: {0}")]
    InvalidMedia(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    /// Create an FFmpeg failure error.
    pub fn ffmpeg_failed(
        code: impl Into<String>,
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            code: code.into(),
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    pub fn invalid_media(message: impl Into<String>) -> Self {
        Self::InvalidMedia(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MediaError::Cancelled)
    }

    /// Wrap into the structured task error.
    ///
    /// FFmpeg failures keep their classified code; anything else becomes
    /// `fallback` owned by `domain`.
    pub fn to_task_error(&self, fallback: ErrorCode, domain: ErrorDomain) -> TaskError {
        match self {
            MediaError::FfmpegFailed { code, message, .. } => {
                TaskError::ffmpeg(code, message).with_meta("step", fallback.as_str())
            }
            other => TaskError::new(fallback, domain).with_meta("err", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_failure_keeps_code() {
        let err = MediaError::ffmpeg_failed("CORRUPT_INPUT", "Packet corrupt", None, Some(1));
        let task_err = err.to_task_error(ErrorCode::SplitSourcesError, ErrorDomain::Splitter);
        assert_eq!(task_err.reason, ErrorCode::FfmpegError);
        assert_eq!(task_err.meta("code"), Some("CORRUPT_INPUT"));
        assert_eq!(task_err.meta("step"), Some("SPLIT_SOURCES_ERROR"));
    }

    #[test]
    fn test_other_errors_use_fallback() {
        let err = MediaError::FileNotFound(PathBuf::from("/tmp/x"));
        let task_err = err.to_task_error(ErrorCode::StitchSourcesError, ErrorDomain::Assembler);
        assert_eq!(task_err.reason, ErrorCode::StitchSourcesError);
        assert_eq!(task_err.domain, ErrorDomain::Assembler);
        assert!(task_err.meta("err").unwrap().contains("/tmp/x"));
    }
}
