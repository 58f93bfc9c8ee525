//! Sharded subtask queue.
//!
//! Each routing class owns [`SHARDS`](crate::keys::SHARDS) lists. All
//! subtasks of a task land on the shard derived from its ID; consumers pop
//! across every shard of their routing class in a random order so no shard
//! starves.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, warn};
use trx_models::Subtask;

use crate::error::{QueueError, QueueResult};
use crate::keys;
use crate::meta::TaskMeta;
use crate::store::QueueStore;

/// Called when a routing class runs low on queued subtasks.
pub trait PopulateHook: Send + Sync {
    fn on_low_water(&self, _routing: &str) {}
}

/// Hook that does nothing.
pub struct NoopPopulate;

impl PopulateHook for NoopPopulate {}

/// Result of one consume attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Dequeued {
    Subtask(Subtask),
    /// Every shard stayed empty for the whole pop timeout
    NoTasks,
    /// A payload was popped and discarded (undecodable or its task is skipped)
    Skip,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub pop_timeout: Duration,
    /// Depth below which the populate hook fires
    pub low_water: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_secs(1),
            low_water: 20,
        }
    }
}

#[derive(Clone)]
pub struct DispatchQueue {
    store: Arc<dyn QueueStore>,
    meta: TaskMeta,
    hook: Arc<dyn PopulateHook>,
    config: DispatchConfig,
}

impl DispatchQueue {
    pub fn new(store: Arc<dyn QueueStore>, config: DispatchConfig) -> Self {
        Self {
            meta: TaskMeta::new(store.clone()),
            store,
            hook: Arc::new(NoopPopulate),
            config,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PopulateHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn meta(&self) -> &TaskMeta {
        &self.meta
    }

    /// Push all subtasks of one task onto its shard.
    pub async fn enqueue(&self, routing: &str, subtasks: &[Subtask]) -> QueueResult<()> {
        let Some(first) = subtasks.first() else {
            return Err(QueueError::enqueue_failed("no subtasks to enqueue"));
        };
        if routing.is_empty() {
            return Err(QueueError::enqueue_failed("empty routing key"));
        }

        let key = keys::queue_shard(routing, first.task_id.shard(keys::SHARDS));
        for subtask in subtasks {
            let payload = serde_json::to_string(subtask)?;
            self.store.push(&key, &payload).await?;
        }

        debug!(
            task_id = %first.task_id,
            routing = routing,
            shard = %key,
            parts = subtasks.len(),
            "Enqueued subtasks"
        );
        Ok(())
    }

    /// Pop one subtask for `routing`.
    pub async fn dequeue(&self, routing: &str) -> QueueResult<Dequeued> {
        let mut shards = keys::queue_shards(routing);
        shards.shuffle(&mut rand::rng());

        let popped = self
            .store
            .blocking_pop_any(&shards, self.config.pop_timeout)
            .await?;

        let outcome = match popped {
            None => Dequeued::NoTasks,
            Some((key, payload)) => self.decode(&key, &payload).await,
        };

        self.check_low_water(routing).await;
        Ok(outcome)
    }

    /// Turn a popped payload into a result. The payload is already off the
    /// list, so this never fails: a subtask that cannot be checked against
    /// the skip flag is delivered and the upload side rejects it if its task
    /// is gone.
    async fn decode(&self, key: &str, payload: &str) -> Dequeued {
        let subtask = match serde_json::from_str::<Subtask>(payload) {
            Ok(subtask) => subtask,
            Err(e) => {
                warn!(shard = %key, error = %e, "Discarding undecodable subtask payload");
                return Dequeued::Skip;
            }
        };

        match self.meta.is_skipped(&subtask.task_id).await {
            Ok(true) => {
                debug!(
                    task_id = %subtask.task_id,
                    part = subtask.part,
                    "Discarding subtask of skipped task"
                );
                Dequeued::Skip
            }
            Ok(false) => Dequeued::Subtask(subtask),
            Err(e) => {
                warn!(
                    task_id = %subtask.task_id,
                    part = subtask.part,
                    error = %e,
                    "Skip check failed, delivering subtask"
                );
                Dequeued::Subtask(subtask)
            }
        }
    }

    /// Total queued subtasks across all shards of `routing`.
    pub async fn depth(&self, routing: &str) -> QueueResult<u64> {
        let mut total = 0;
        for key in keys::queue_shards(routing) {
            total += self.store.len(&key).await?;
        }
        Ok(total)
    }

    async fn check_low_water(&self, routing: &str) {
        match self.depth(routing).await {
            Ok(depth) if depth < self.config.low_water => self.hook.on_low_water(routing),
            Ok(_) => {}
            Err(e) => warn!(routing = routing, error = %e, "Failed to read queue depth"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryQueueStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use trx_models::{AudioJob, SubtaskPayload, TaskId};

    fn subtasks(id: TaskId, n: u32) -> Vec<Subtask> {
        (0..n)
            .map(|part| {
                Subtask::new(
                    id,
                    part,
                    n,
                    SubtaskPayload::Audio(AudioJob {
                        track: part,
                        codec: "aac".into(),
                        bitrate_kbps: 128,
                        duration: 10.0,
                    }),
                    "http://composer/chunk",
                    "http://composer/upload",
                )
            })
            .collect()
    }

    fn queue(store: Arc<MemoryQueueStore>) -> DispatchQueue {
        DispatchQueue::new(
            store,
            DispatchConfig {
                pop_timeout: Duration::from_millis(20),
                low_water: 20,
            },
        )
    }

    #[derive(Default)]
    struct CountingHook(AtomicUsize);

    impl PopulateHook for CountingHook {
        fn on_low_water(&self, _routing: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_subtasks_share_one_shard() {
        let store = Arc::new(MemoryQueueStore::new());
        let q = queue(store.clone());
        let id = TaskId::new();
        q.enqueue("cpu", &subtasks(id, 3)).await.unwrap();

        let shard = keys::queue_shard("cpu", id.shard(keys::SHARDS));
        assert_eq!(store.len(&shard).await.unwrap(), 3);
        assert_eq!(q.depth("cpu").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_empty_queue_reports_no_tasks() {
        let q = queue(Arc::new(MemoryQueueStore::new()));
        assert_eq!(q.dequeue("cpu").await.unwrap(), Dequeued::NoTasks);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_skipped() {
        let store = Arc::new(MemoryQueueStore::new());
        store.push(&keys::queue_shard("cpu", 4), "{not json").await.unwrap();

        let q = queue(store.clone());
        assert_eq!(q.dequeue("cpu").await.unwrap(), Dequeued::Skip);
        assert_eq!(q.depth("cpu").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_skipped_task_is_discarded() {
        let q = queue(Arc::new(MemoryQueueStore::new()));
        let id = TaskId::new();
        q.enqueue("cpu", &subtasks(id, 2)).await.unwrap();
        q.meta().set_skip(&id).await.unwrap();

        assert_eq!(q.dequeue("cpu").await.unwrap(), Dequeued::Skip);
        assert_eq!(q.dequeue("cpu").await.unwrap(), Dequeued::Skip);
        assert_eq!(q.dequeue("cpu").await.unwrap(), Dequeued::NoTasks);
    }

    #[tokio::test]
    async fn test_low_water_hook_fires() {
        let hook = Arc::new(CountingHook::default());
        let q = queue(Arc::new(MemoryQueueStore::new())).with_hook(hook.clone());
        let id = TaskId::new();
        q.enqueue("gpu", &subtasks(id, 1)).await.unwrap();

        match q.dequeue("gpu").await.unwrap() {
            Dequeued::Subtask(s) => assert_eq!(s.task_id, id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_routing_classes_are_isolated() {
        let q = queue(Arc::new(MemoryQueueStore::new()));
        q.enqueue("gpu", &subtasks(TaskId::new(), 1)).await.unwrap();
        assert_eq!(q.dequeue("cpu").await.unwrap(), Dequeued::NoTasks);
    }

    /// Memory store whose key lookups fail while `fail_exists` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryQueueStore,
        fail_exists: AtomicBool,
    }

    #[async_trait]
    impl QueueStore for FlakyStore {
        async fn push(&self, key: &str, value: &str) -> QueueResult<()> {
            self.inner.push(key, value).await
        }
        async fn blocking_pop_any(
            &self,
            keys: &[String],
            timeout: Duration,
        ) -> QueueResult<Option<(String, String)>> {
            self.inner.blocking_pop_any(keys, timeout).await
        }
        async fn len(&self, key: &str) -> QueueResult<u64> {
            self.inner.len(key).await
        }
        async fn incr(&self, key: &str) -> QueueResult<i64> {
            self.inner.incr(key).await
        }
        async fn incr_by_with_ttl(&self, key: &str, by: i64, ttl: Duration) -> QueueResult<i64> {
            self.inner.incr_by_with_ttl(key, by, ttl).await
        }
        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()> {
            self.inner.set_with_ttl(key, value, ttl).await
        }
        async fn set_max_with_ttl(&self, key: &str, value: i64, ttl: Duration) -> QueueResult<i64> {
            self.inner.set_max_with_ttl(key, value, ttl).await
        }
        async fn get(&self, key: &str) -> QueueResult<Option<String>> {
            self.inner.get(key).await
        }
        async fn exists(&self, key: &str) -> QueueResult<bool> {
            if self.fail_exists.load(Ordering::SeqCst) {
                return Err(QueueError::connection_failed("connection reset"));
            }
            self.inner.exists(key).await
        }
        async fn delete(&self, key: &str) -> QueueResult<()> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_popped_subtask_survives_failed_skip_check() {
        let store = Arc::new(FlakyStore::default());
        let q = DispatchQueue::new(
            store.clone(),
            DispatchConfig {
                pop_timeout: Duration::from_millis(20),
                low_water: 0,
            },
        );
        let id = TaskId::new();
        q.enqueue("cpu", &subtasks(id, 1)).await.unwrap();

        store.fail_exists.store(true, Ordering::SeqCst);
        match q.dequeue("cpu").await.unwrap() {
            Dequeued::Subtask(s) => assert_eq!((s.task_id, s.part), (id, 0)),
            other => panic!("expected the subtask, got {other:?}"),
        }
        assert_eq!(q.depth("cpu").await.unwrap(), 0);
    }
}
