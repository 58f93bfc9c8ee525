//! Task definitions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{TaskError, TaskStatus};

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Shard index in `0..shards`, stable for the lifetime of the task.
    pub fn shard(&self, shards: usize) -> usize {
        (self.0.as_u128() % shards.max(1) as u128) as usize
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Where the source media lives. Exactly one of `url` or `path` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct TaskSource {
    /// Remote HTTP(S) URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Path on the coordinator's filesystem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl TaskSource {
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            path: None,
        }
    }

    pub fn fs(path: impl Into<String>) -> Self {
        Self {
            url: None,
            path: Some(path.into()),
        }
    }

    /// The location FFmpeg should read from.
    pub fn location(&self) -> Option<&str> {
        self.url.as_deref().or(self.path.as_deref())
    }

    pub fn check(&self) -> Result<(), &'static str> {
        match (&self.url, &self.path) {
            (Some(_), Some(_)) => Err("source must set only one of url or path"),
            (None, None) => Err("source must set url or path"),
            (Some(url), None) => match url::Url::parse(url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
                Ok(_) => Err("source url must be http or https"),
                Err(_) => Err("source url is not a valid URL"),
            },
            (None, Some(path)) if path.trim().is_empty() => Err("source path is empty"),
            (None, Some(_)) => Ok(()),
        }
    }
}

/// Encoder class requested for a task; drives the routing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl EncoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderKind::Auto => "auto",
            EncoderKind::Cpu => "cpu",
            EncoderKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncoderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" | "" => Ok(EncoderKind::Auto),
            "cpu" => Ok(EncoderKind::Cpu),
            "gpu" => Ok(EncoderKind::Gpu),
            other => Err(format!("unknown encoder kind: {other}")),
        }
    }
}

/// Per-task feature flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct TaskSettings {
    #[serde(default)]
    pub encrypt: bool,
    /// Free-form flags passed through to the pipeline untouched
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A transcoding task as stored in the claim store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    pub id: TaskId,
    pub source: TaskSource,
    #[serde(default)]
    pub encoder: EncoderKind,
    pub status: TaskStatus,

    /// Routing class, assigned at admission
    #[serde(default)]
    pub routing: String,

    /// Host the task is bound to; empty when unbound
    #[serde(default)]
    pub hostname: String,

    /// Source duration in seconds
    pub duration: f64,
    /// Source size in bytes
    pub file_size: i64,
    #[serde(default)]
    pub settings: TaskSettings,

    /// Number of subtasks, set when the split phase enqueues them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts_total: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task from a submission form.
    pub fn from_form(form: CreateTaskForm) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            source: form.source,
            encoder: form.encoder,
            status: TaskStatus::Pending,
            routing: String::new(),
            hostname: String::new(),
            duration: form.duration,
            file_size: form.file_size,
            settings: form.settings,
            parts_total: None,
            error: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Duration in whole milliseconds, used to clamp encoding progress.
    pub fn duration_ms(&self) -> i64 {
        (self.duration * 1000.0).round() as i64
    }
}

/// Submission payload for a new task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[validate(schema(function = "validate_source_form"))]
pub struct CreateTaskForm {
    pub source: TaskSource,
    #[serde(default)]
    pub encoder: EncoderKind,
    #[validate(range(exclusive_min = 0.0))]
    pub duration: f64,
    #[validate(range(exclusive_min = 0))]
    pub file_size: i64,
    #[serde(default)]
    pub settings: TaskSettings,
}

fn validate_source_form(form: &CreateTaskForm) -> Result<(), ValidationError> {
    form.source.check().map_err(|msg| {
        let mut err = ValidationError::new("source");
        err.message = Some(msg.into());
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(source: TaskSource) -> CreateTaskForm {
        CreateTaskForm {
            source,
            encoder: EncoderKind::Auto,
            duration: 120.0,
            file_size: 10_000,
            settings: TaskSettings::default(),
        }
    }

    #[test]
    fn test_task_creation() {
        let task = Task::from_form(form(TaskSource::http("https://cdn.example.com/in.mp4")));

        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.hostname.is_empty());
        assert!(task.parts_total.is_none());
        assert_eq!(task.duration_ms(), 120_000);
        assert!(!task.is_deleted());
    }

    #[test]
    fn test_source_exactly_one() {
        assert!(form(TaskSource::http("https://a/b.mp4")).validate().is_ok());
        assert!(form(TaskSource::fs("/media/in.mov")).validate().is_ok());
        assert!(form(TaskSource::default()).validate().is_err());

        let both = TaskSource {
            url: Some("https://a/b.mp4".into()),
            path: Some("/media/in.mov".into()),
        };
        assert!(form(both).validate().is_err());
        assert!(form(TaskSource::http("ftp://a/b.mp4")).validate().is_err());
    }

    #[test]
    fn test_form_rejects_non_positive_sizes() {
        let mut f = form(TaskSource::fs("/media/in.mov"));
        f.duration = 0.0;
        assert!(f.validate().is_err());

        let mut f = form(TaskSource::fs("/media/in.mov"));
        f.file_size = 0;
        assert!(f.validate().is_err());
    }

    #[test]
    fn test_task_id_shard_is_stable() {
        let id = TaskId::new();
        let shard = id.shard(10);
        assert!(shard < 10);
        assert_eq!(shard, id.shard(10));
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
    }
}
