//! Structured task errors.
//!
//! A `TaskError` is the single form in which a failure crosses a process
//! boundary or gets persisted with a task. Low-level errors are wrapped into
//! it once, at the point where they become significant for the task.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reason code attached to a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownError,
    ChunkOverflow,
    TaskResetByWorker,
    GenericError,
    NetworkError,
    FfmpegError,
    SplitSourcesError,
    StitchSourcesError,
    FragmentSourcesError,
    EncryptSourcesError,
    GeneratePosterError,
    DbError,
    RedisError,
    UploadError,
    UnmuxAudioError,
    Validation,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
            ErrorCode::ChunkOverflow => "CHUNK_OVERFLOW",
            ErrorCode::TaskResetByWorker => "TASK_RESET_BY_WORKER",
            ErrorCode::GenericError => "GENERIC_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::FfmpegError => "FFMPEG_ERROR",
            ErrorCode::SplitSourcesError => "SPLIT_SOURCES_ERROR",
            ErrorCode::StitchSourcesError => "STITCH_SOURCES_ERROR",
            ErrorCode::FragmentSourcesError => "FRAGMENT_SOURCES_ERROR",
            ErrorCode::EncryptSourcesError => "ENCRYPT_SOURCES_ERROR",
            ErrorCode::GeneratePosterError => "GENERATE_POSTER_ERROR",
            ErrorCode::DbError => "DB_ERROR",
            ErrorCode::RedisError => "REDIS_ERROR",
            ErrorCode::UploadError => "UPLOAD_ERROR",
            ErrorCode::UnmuxAudioError => "UNMUX_AUDIO_ERROR",
            ErrorCode::Validation => "VALIDATION",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component that owns a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDomain {
    Splitter,
    Assembler,
    Encoder,
    Composer,
    Ffmpeg,
    Transcoder,
}

impl ErrorDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorDomain::Splitter => "splitter",
            ErrorDomain::Assembler => "assembler",
            ErrorDomain::Encoder => "encoder",
            ErrorDomain::Composer => "composer",
            ErrorDomain::Ffmpeg => "ffmpeg",
            ErrorDomain::Transcoder => "transcoder",
        }
    }
}

/// Structured error persisted with a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskError {
    pub reason: ErrorCode,
    pub domain: ErrorDomain,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl TaskError {
    pub fn new(reason: ErrorCode, domain: ErrorDomain) -> Self {
        Self {
            reason,
            domain,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// More completion reports arrived than subtasks were enqueued.
    pub fn chunk_overflow(need: u32, actual: i64) -> Self {
        Self::new(ErrorCode::ChunkOverflow, ErrorDomain::Composer)
            .with_meta("need", need)
            .with_meta("actual", actual)
    }

    /// Wrap an unclassified failure, keeping the original message.
    pub fn unknown(domain: ErrorDomain, err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::UnknownError, domain).with_meta("err", err)
    }

    pub fn validation(domain: ErrorDomain, message: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Validation, domain).with_meta("err", message)
    }

    pub fn ffmpeg(code: &str, message: impl fmt::Display) -> Self {
        Self::new(ErrorCode::FfmpegError, ErrorDomain::Ffmpeg)
            .with_meta("code", code)
            .with_meta("err", message)
    }

    pub fn db(domain: ErrorDomain, err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DbError, domain).with_meta("err", err)
    }

    pub fn redis(domain: ErrorDomain, err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::RedisError, domain).with_meta("err", err)
    }

    pub fn task_reset(hostname: &str) -> Self {
        Self::new(ErrorCode::TaskResetByWorker, ErrorDomain::Encoder).with_meta("hostname", hostname)
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.domain.as_str())?;
        if let Some(err) = self.metadata.get("err") {
            write!(f, ": {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_overflow_metadata() {
        let err = TaskError::chunk_overflow(4, 5);
        assert_eq!(err.reason, ErrorCode::ChunkOverflow);
        assert_eq!(err.meta("need"), Some("4"));
        assert_eq!(err.meta("actual"), Some("5"));
    }

    #[test]
    fn test_wire_format() {
        let err = TaskError::ffmpeg("CORRUPT_INPUT", "exit 1");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["reason"], "FFMPEG_ERROR");
        assert_eq!(json["domain"], "ffmpeg");
        assert_eq!(json["metadata"]["code"], "CORRUPT_INPUT");

        let back: TaskError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_code_strings_match_serde() {
        for code in [ErrorCode::TaskResetByWorker, ErrorCode::Validation, ErrorCode::DbError] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }
}
