//! Cooperative cancellation of a running phase.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use trx_models::TaskId;
use trx_queue::TaskMeta;
use trx_store::ClaimStore;

/// Polls the claim store while a phase holds a task and flips a `watch`
/// flag once the task is canceled or deleted. The flag is what running
/// FFmpeg children are tied to.
///
/// On detection the task's skip flag is set as well, so subtasks still
/// sitting in the dispatch queue are discarded. Dropping the watch stops
/// the poller.
pub struct CancelWatch {
    rx: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

impl CancelWatch {
    pub fn spawn(store: Arc<dyn ClaimStore>, meta: TaskMeta, id: TaskId, poll: Duration) -> Self {
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let canceled = match store.is_canceled(id).await {
                    Ok(canceled) => canceled,
                    Err(e) if e.is_not_found() => true,
                    Err(e) => {
                        debug!(task_id = %id, error = %e, "Cancel check failed");
                        false
                    }
                };

                if canceled {
                    warn!(task_id = %id, "Task canceled while in progress");
                    if let Err(e) = meta.set_skip(&id).await {
                        warn!(task_id = %id, error = %e, "Failed to set skip flag");
                    }
                    let _ = tx.send(true);
                    break;
                }
            }
        });

        Self { rx, handle }
    }

    /// Receiver that flips to `true` on cancel.
    pub fn receiver(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }
}

impl Drop for CancelWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trx_models::{CreateTaskForm, TaskSource, TaskStatus};
    use trx_queue::MemoryQueueStore;
    use trx_store::MemoryClaimStore;

    #[tokio::test]
    async fn test_cancel_is_detected() {
        let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
        let meta = TaskMeta::new(Arc::new(MemoryQueueStore::new()));
        let task = store
            .create(CreateTaskForm {
                source: TaskSource::fs("/in.mp4"),
                encoder: Default::default(),
                duration: 1.0,
                file_size: 1,
                settings: Default::default(),
            })
            .await
            .unwrap();

        let watch = CancelWatch::spawn(store.clone(), meta.clone(), task.id, Duration::from_millis(10));
        let mut rx = watch.receiver();
        assert!(!watch.is_canceled());

        store.update_status(task.id, TaskStatus::Canceled, None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|c| *c))
            .await
            .unwrap()
            .unwrap();

        assert!(watch.is_canceled());
        assert!(meta.is_skipped(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_task_counts_as_canceled() {
        let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
        let meta = TaskMeta::new(Arc::new(MemoryQueueStore::new()));
        let watch = CancelWatch::spawn(store, meta, TaskId::new(), Duration::from_millis(10));

        let mut rx = watch.receiver();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|c| *c))
            .await
            .unwrap()
            .unwrap();
    }
}
