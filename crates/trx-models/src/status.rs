//! Task lifecycle status.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status of a task as persisted in the claim store.
///
/// The happy path is strictly linear:
/// `pending → waiting-splitting → splitting → encoding → waiting-assembling → assembling → done`.
/// `error` and `canceled` are reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Submitted, not yet admitted to a routing class
    #[default]
    Pending,
    /// Admitted, waiting for a splitter to claim it
    WaitingSplitting,
    /// Claimed by a splitter
    Splitting,
    /// Subtasks are on the dispatch queue
    Encoding,
    /// Every subtask reported completion
    WaitingAssembling,
    /// Claimed by an assembler
    Assembling,
    /// Finished; write-protected
    Done,
    /// Failed with a structured error
    Error,
    /// Canceled or deleted by an external request
    Canceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Pending,
        TaskStatus::WaitingSplitting,
        TaskStatus::Splitting,
        TaskStatus::Encoding,
        TaskStatus::WaitingAssembling,
        TaskStatus::Assembling,
        TaskStatus::Done,
        TaskStatus::Error,
        TaskStatus::Canceled,
    ];

    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::WaitingSplitting => "waiting-splitting",
            TaskStatus::Splitting => "splitting",
            TaskStatus::Encoding => "encoding",
            TaskStatus::WaitingAssembling => "waiting-assembling",
            TaskStatus::Assembling => "assembling",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error | TaskStatus::Canceled)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `done` accepts nothing. `error` and `canceled` accept nothing either,
    /// except that a canceled task may still be recorded as failed by the
    /// phase that was running when the cancel landed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, next) {
            (Done, _) => false,
            (Error, _) => false,
            (Canceled, Error) => true,
            (Canceled, _) => false,
            (_, Error) | (_, Canceled) => true,
            (Pending, WaitingSplitting)
            | (WaitingSplitting, Splitting)
            | (Splitting, Encoding)
            | (Encoding, WaitingAssembling)
            | (WaitingAssembling, Assembling)
            | (Assembling, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returned when a stored status string is not a known status.
#[derive(Debug, Clone, Error)]
#[error("unknown task status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}
