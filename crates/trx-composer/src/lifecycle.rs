//! Task lifecycle: status writes, failure and cancellation.

use std::sync::Arc;

use tracing::{debug, info, warn};
use trx_models::{CreateTaskForm, Task, TaskError, TaskId, TaskStatus};
use trx_queue::TaskMeta;
use trx_store::ClaimStore;

use crate::error::ComposerResult;
use crate::metrics;

/// Result of a cancel or delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// Task had already finished (done or failed); nothing changed
    AlreadyFinished(TaskStatus),
}

/// Status state machine on top of the claim store, with the skip flag kept
/// in step on the queue store.
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn ClaimStore>,
    meta: TaskMeta,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn ClaimStore>, meta: TaskMeta) -> Self {
        Self { store, meta }
    }

    pub fn store(&self) -> &Arc<dyn ClaimStore> {
        &self.store
    }

    pub fn meta(&self) -> &TaskMeta {
        &self.meta
    }

    pub async fn submit(&self, form: CreateTaskForm) -> ComposerResult<Task> {
        let task = self.store.create(form).await?;
        metrics::record_submitted();
        info!(task_id = %task.id, encoder = task.encoder.as_str(), "Task submitted");
        Ok(task)
    }

    pub async fn get(&self, id: TaskId) -> ComposerResult<Task> {
        Ok(self.store.get(id).await?)
    }

    /// Move `task` forward. Out-of-order writes are logged, not rejected;
    /// only `done` is write-protected (by the store).
    pub async fn advance(&self, task: &Task, next: TaskStatus) -> ComposerResult<bool> {
        if !task.status.can_transition_to(next) {
            warn!(
                task_id = %task.id,
                from = %task.status,
                to = %next,
                "Unexpected status transition"
            );
        }
        let updated = self.store.update_status(task.id, next, None).await?;
        if !updated {
            debug!(task_id = %task.id, to = %next, "Status write ignored");
        }
        Ok(updated)
    }

    /// Record a failure and stop all outstanding work of the task.
    pub async fn fail(&self, id: TaskId, error: &TaskError) -> ComposerResult<()> {
        warn!(task_id = %id, reason = %error.reason, domain = error.domain.as_str(), "Task failed: {}", error);
        self.meta.set_skip(&id).await?;
        if self.store.update_status(id, TaskStatus::Error, Some(error)).await? {
            metrics::record_failed(error.reason.as_str());
        }
        Ok(())
    }

    /// Cancel a task on request. Running phases notice on their next poll.
    pub async fn cancel(&self, id: TaskId) -> ComposerResult<CancelOutcome> {
        let task = self.store.get(id).await?;
        if matches!(task.status, TaskStatus::Done | TaskStatus::Error) {
            return Ok(CancelOutcome::AlreadyFinished(task.status));
        }

        self.meta.set_skip(&id).await?;
        if task.status != TaskStatus::Canceled
            && self.store.update_status(id, TaskStatus::Canceled, None).await?
        {
            metrics::record_canceled();
            info!(task_id = %id, from = %task.status, "Task canceled");
        }
        Ok(CancelOutcome::Canceled)
    }

    /// Soft-delete a task, canceling it first if it is still running.
    pub async fn delete(&self, id: TaskId) -> ComposerResult<()> {
        let task = self.store.get(id).await?;

        self.meta.set_skip(&id).await?;
        self.store.soft_delete(id).await?;
        if !task.status.is_terminal() && self.store.update_status(id, TaskStatus::Canceled, None).await? {
            metrics::record_canceled();
        }
        info!(task_id = %id, status = %task.status, "Task deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trx_models::{ErrorCode, ErrorDomain, TaskSource};
    use trx_queue::MemoryQueueStore;
    use trx_store::MemoryClaimStore;

    fn lifecycle() -> Lifecycle {
        Lifecycle::new(
            Arc::new(MemoryClaimStore::new()),
            TaskMeta::new(Arc::new(MemoryQueueStore::new())),
        )
    }

    fn form() -> CreateTaskForm {
        CreateTaskForm {
            source: TaskSource::http("https://cdn.example.com/in.mp4"),
            encoder: Default::default(),
            duration: 30.0,
            file_size: 1024,
            settings: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_cancel_sets_skip_and_status() {
        let lc = lifecycle();
        let task = lc.submit(form()).await.unwrap();

        assert_eq!(lc.cancel(task.id).await.unwrap(), CancelOutcome::Canceled);
        assert!(lc.meta().is_skipped(&task.id).await.unwrap());
        assert_eq!(lc.get(task.id).await.unwrap().status, TaskStatus::Canceled);

        // Idempotent
        assert_eq!(lc.cancel(task.id).await.unwrap(), CancelOutcome::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_after_done_is_refused() {
        let lc = lifecycle();
        let task = lc.submit(form()).await.unwrap();
        lc.store().update_status(task.id, TaskStatus::Done, None).await.unwrap();

        assert_eq!(
            lc.cancel(task.id).await.unwrap(),
            CancelOutcome::AlreadyFinished(TaskStatus::Done)
        );
        assert!(!lc.meta().is_skipped(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_marks_deleted_and_canceled() {
        let lc = lifecycle();
        let task = lc.submit(form()).await.unwrap();

        lc.delete(task.id).await.unwrap();
        let stored = lc.get(task.id).await.unwrap();
        assert!(stored.is_deleted());
        assert_eq!(stored.status, TaskStatus::Canceled);
        assert!(lc.store().is_canceled(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let lc = lifecycle();
        let task = lc.submit(form()).await.unwrap();
        let err = TaskError::new(ErrorCode::SplitSourcesError, ErrorDomain::Splitter);

        lc.fail(task.id, &err).await.unwrap();
        let stored = lc.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
        assert_eq!(stored.error, Some(err));
        assert!(lc.meta().is_skipped(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_done_is_never_overwritten() {
        let lc = lifecycle();
        let task = lc.submit(form()).await.unwrap();
        lc.store().update_status(task.id, TaskStatus::Done, None).await.unwrap();

        let done = lc.get(task.id).await.unwrap();
        assert!(!lc.advance(&done, TaskStatus::Encoding).await.unwrap());
        lc.fail(task.id, &TaskError::chunk_overflow(1, 2)).await.unwrap();
        assert_eq!(lc.get(task.id).await.unwrap().status, TaskStatus::Done);
    }
}
