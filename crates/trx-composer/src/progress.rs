//! Encoding progress accounting.

use trx_models::{progress, ProgressReport, TaskId};

use crate::error::ComposerResult;
use crate::lifecycle::Lifecycle;

/// Accumulates encoded media time reported by workers and maps it onto
/// the encoding range of the task's progress value.
#[derive(Clone)]
pub struct ProgressTracker {
    lifecycle: Lifecycle,
}

impl ProgressTracker {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self { lifecycle }
    }

    /// Apply one report; returns the stored progress afterwards.
    pub async fn report(&self, report: &ProgressReport) -> ComposerResult<i64> {
        let meta = self.lifecycle.meta();
        if report.delta_ms <= 0 || meta.is_skipped(&report.task_id).await? {
            return Ok(meta.progress(&report.task_id).await?);
        }

        let encoded_ms = meta.add_encoded(&report.task_id, report.delta_ms).await?;
        let duration = self.lifecycle.store().get_duration(report.task_id).await?;
        let percent = progress::encoding_percent(encoded_ms, (duration * 1000.0).round() as i64);

        Ok(meta.advance_progress(&report.task_id, percent).await?)
    }

    pub async fn get(&self, id: TaskId) -> ComposerResult<i64> {
        Ok(self.lifecycle.meta().progress(&id).await?)
    }
}
