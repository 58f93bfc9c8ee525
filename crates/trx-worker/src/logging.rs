//! Structured logging for one subtask run.

use tracing::{error, info, warn, Span};
use trx_models::Subtask;

/// Logger carrying the subtask's identity into every line.
#[derive(Debug, Clone)]
pub struct SubtaskLogger {
    task_id: String,
    part: u32,
    parts_total: u32,
    kind: &'static str,
    source_codec: Option<String>,
}

impl SubtaskLogger {
    pub fn new(subtask: &Subtask) -> Self {
        Self {
            task_id: subtask.task_id.to_string(),
            part: subtask.part,
            parts_total: subtask.parts_total,
            kind: subtask.payload.kind(),
            source_codec: subtask.source_codec().map(str::to_string),
        }
    }

    pub fn log_start(&self, slot: usize, weight: u32) {
        info!(
            task_id = %self.task_id,
            part = self.part,
            parts_total = self.parts_total,
            kind = self.kind,
            source_codec = self.source_codec.as_deref(),
            slot,
            weight,
            "Subtask started"
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(task_id = %self.task_id, part = self.part, kind = self.kind, "{}", message);
    }

    pub fn log_warning(&self, message: &str) {
        warn!(task_id = %self.task_id, part = self.part, kind = self.kind, "{}", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(task_id = %self.task_id, part = self.part, kind = self.kind, "Subtask failed: {}", message);
    }

    pub fn log_completion(&self, elapsed_secs: f64) {
        info!(
            task_id = %self.task_id,
            part = self.part,
            kind = self.kind,
            elapsed_secs,
            "Subtask completed"
        );
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn part(&self) -> u32 {
        self.part
    }

    /// Span wrapping the whole run, so nested media logs carry the ids.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("subtask", task_id = %self.task_id, part = self.part, kind = self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trx_models::{AudioJob, SubtaskPayload, TaskId};

    #[test]
    fn test_logger_carries_identity() {
        let subtask = Subtask::new(
            TaskId::new(),
            3,
            4,
            SubtaskPayload::Audio(AudioJob {
                track: 0,
                codec: "aac".into(),
                bitrate_kbps: 128,
                duration: 30.0,
            }),
            "http://c/v1/chunks",
            "http://c/v1/tasks/x/parts",
        );
        let logger = SubtaskLogger::new(&subtask);

        assert_eq!(logger.task_id(), subtask.task_id.to_string());
        assert_eq!(logger.part(), 3);
        logger.log_progress("downloading");
        let _span = logger.create_span();
    }
}
