//! Wire types exchanged between workers and the composer.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Subtask, TaskError, TaskId, TaskStatus};

/// Worker identity sent with every dispatch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NextSubtaskRequest {
    pub hostname: String,
    pub worker_id: String,
    /// Routing class the worker consumes
    pub routing: String,
}

/// Answer to a dispatch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchResponse {
    Subtask { subtask: Box<Subtask> },
    /// Every shard of the routing class was empty
    NoTasks,
    /// A subtask was dequeued but must not run; ask again immediately
    Skip,
}

/// Encoded media time since the previous report for the same task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressReport {
    pub task_id: TaskId,
    pub delta_ms: i64,
}

/// Result of one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompletionReport {
    pub task_id: TaskId,
    pub part: u32,
    pub parts_total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl CompletionReport {
    pub fn success(subtask: &Subtask) -> Self {
        Self {
            task_id: subtask.task_id,
            part: subtask.part,
            parts_total: subtask.parts_total,
            error: None,
        }
    }

    pub fn failure(subtask: &Subtask, error: TaskError) -> Self {
        Self {
            error: Some(error),
            ..Self::success(subtask)
        }
    }
}

/// What the fan-in did with a completion report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// Counted; more parts outstanding
    Counted { count: i64, parts_total: u32 },
    /// Last part; task moved to the given status
    Completed { status: TaskStatus },
    /// Too many reports; task failed
    Overflow { need: u32, actual: i64 },
    /// Error report recorded; task failed
    Failed,
    /// Task already skipped, canceled or failed; report dropped
    Ignored,
}
