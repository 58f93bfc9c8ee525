//! Completion counting for a task's subtasks.

use tracing::{debug, error, info, warn};
use trx_models::{progress, CompletionOutcome, CompletionReport, TaskError, TaskStatus};

use crate::error::ComposerResult;
use crate::lifecycle::Lifecycle;
use crate::metrics;

/// Turns completion reports into lifecycle transitions.
///
/// Success reports bump the task's counter. The report that makes the count
/// equal to the parts total moves the task to `waiting-assembling`; any
/// report beyond that fails the task with `CHUNK_OVERFLOW`.
///
/// Once a report is counted, only a failed status write is returned as an
/// error, and the count is reverted first.
#[derive(Clone)]
pub struct FanIn {
    lifecycle: Lifecycle,
}

impl FanIn {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self { lifecycle }
    }

    pub async fn report(&self, report: &CompletionReport) -> ComposerResult<CompletionOutcome> {
        let id = report.task_id;
        let meta = self.lifecycle.meta();

        if let Some(error) = &report.error {
            warn!(task_id = %id, part = report.part, "Subtask failed: {}", error);
            self.lifecycle.fail(id, error).await?;
            metrics::record_completion("failed");
            return Ok(CompletionOutcome::Failed);
        }

        if meta.is_skipped(&id).await? {
            debug!(task_id = %id, part = report.part, "Ignoring completion of skipped task");
            metrics::record_completion("ignored");
            return Ok(CompletionOutcome::Ignored);
        }

        let count = meta.incr_completed(&id).await?;
        let total = i64::from(report.parts_total);

        let outcome = if count < total {
            debug!(task_id = %id, part = report.part, count, total, "Subtask completed");
            CompletionOutcome::Counted {
                count,
                parts_total: report.parts_total,
            }
        } else if count == total {
            if let Err(e) = self
                .lifecycle
                .store()
                .update_status(id, TaskStatus::WaitingAssembling, None)
                .await
            {
                // The worker resends on error; the resend must land on C == T again.
                if let Err(undo) = meta.uncount_completed(&id).await {
                    error!(task_id = %id, error = %undo, "Failed to revert completion count");
                }
                return Err(e.into());
            }
            if let Err(e) = meta.advance_progress(&id, progress::AFTER_ENCODING).await {
                warn!(task_id = %id, error = %e, "Failed to record encoding progress");
            }
            info!(task_id = %id, parts = total, "All subtasks completed");
            CompletionOutcome::Completed {
                status: TaskStatus::WaitingAssembling,
            }
        } else {
            let error = TaskError::chunk_overflow(report.parts_total, count);
            self.lifecycle.fail(id, &error).await?;
            metrics::record_overflow();
            CompletionOutcome::Overflow {
                need: report.parts_total,
                actual: count,
            }
        };

        metrics::record_completion(outcome_label(&outcome));
        Ok(outcome)
    }
}

fn outcome_label(outcome: &CompletionOutcome) -> &'static str {
    match outcome {
        CompletionOutcome::Counted { .. } => "counted",
        CompletionOutcome::Completed { .. } => "completed",
        CompletionOutcome::Overflow { .. } => "overflow",
        CompletionOutcome::Failed => "failed",
        CompletionOutcome::Ignored => "ignored",
    }
}
