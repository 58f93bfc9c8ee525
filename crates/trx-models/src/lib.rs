//! Shared data models for the transcoding pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Tasks, their sources, settings and lifecycle status
//! - Subtasks placed on the dispatch queue
//! - Structured task errors persisted with a failed task
//! - Progress checkpoints
//! - Wire types exchanged between the composer and workers

pub mod error;
pub mod progress;
pub mod rpc;
pub mod status;
pub mod subtask;
pub mod task;

// Re-export common types
pub use error::{ErrorCode, ErrorDomain, TaskError};
pub use rpc::{CompletionOutcome, CompletionReport, DispatchResponse, NextSubtaskRequest, ProgressReport};
pub use status::{ParseStatusError, TaskStatus};
pub use subtask::{AudioJob, Preset, Subtask, SubtaskPayload, VideoJob};
pub use task::{CreateTaskForm, EncoderKind, Task, TaskId, TaskSettings, TaskSource};
