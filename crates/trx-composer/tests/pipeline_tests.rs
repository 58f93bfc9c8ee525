//! Lifecycle, fan-in, dispatch and cancellation against the in-memory stores.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use trx_composer::cancellation::CancelWatch;
use trx_composer::{FanIn, Lifecycle, ProgressTracker};
use trx_models::{
    progress, AudioJob, CompletionOutcome, CompletionReport, CreateTaskForm, ErrorCode, ProgressReport, Subtask,
    SubtaskPayload, Task, TaskError, TaskId, TaskSource, TaskStatus,
};
use trx_queue::{
    DispatchConfig, DispatchQueue, Dequeued, MemoryQueueStore, QueueError, QueueResult, QueueStore, TaskMeta,
};
use trx_store::{ClaimRequest, ClaimStore, MemoryClaimStore, RoutingBacklog, StoreError, StoreResult};

/// Switches that make individual store operations fail.
#[derive(Default)]
struct Faults {
    set_max: AtomicBool,
    exists: AtomicBool,
    update_status: AtomicBool,
}

impl Faults {
    fn set(flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }

    fn queue_err(flag: &AtomicBool) -> QueueResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(QueueError::connection_failed("connection reset by peer"));
        }
        Ok(())
    }
}

struct FlakyQueue {
    inner: MemoryQueueStore,
    faults: Arc<Faults>,
}

#[async_trait]
impl QueueStore for FlakyQueue {
    async fn push(&self, key: &str, value: &str) -> QueueResult<()> {
        self.inner.push(key, value).await
    }
    async fn blocking_pop_any(&self, keys: &[String], timeout: Duration) -> QueueResult<Option<(String, String)>> {
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
        Faults::queue_err(&self.faults.set_max)?;
        self.inner.set_max_with_ttl(key, value, ttl).await
    }
    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        self.inner.get(key).await
    }
    async fn exists(&self, key: &str) -> QueueResult<bool> {
        Faults::queue_err(&self.faults.exists)?;
        self.inner.exists(key).await
    }
    async fn delete(&self, key: &str) -> QueueResult<()> {
        self.inner.delete(key).await
    }
}

struct FlakyClaims {
    inner: MemoryClaimStore,
    faults: Arc<Faults>,
}

#[async_trait]
impl ClaimStore for FlakyClaims {
    async fn create(&self, form: CreateTaskForm) -> StoreResult<Task> {
        self.inner.create(form).await
    }
    async fn get(&self, id: TaskId) -> StoreResult<Task> {
        self.inner.get(id).await
    }
    async fn claim_next(&self, request: &ClaimRequest) -> StoreResult<Option<Task>> {
        self.inner.claim_next(request).await
    }
    async fn update_status(&self, id: TaskId, status: TaskStatus, error: Option<&TaskError>) -> StoreResult<bool> {
        if self.faults.update_status.load(Ordering::SeqCst) {
            return Err(StoreError::corrupt(id, "connection reset by peer"));
        }
        self.inner.update_status(id, status, error).await
    }
    async fn start_encoding(&self, id: TaskId, parts_total: u32) -> StoreResult<bool> {
        self.inner.start_encoding(id, parts_total).await
    }
    async fn is_canceled(&self, id: TaskId) -> StoreResult<bool> {
        self.inner.is_canceled(id).await
    }
    async fn get_duration(&self, id: TaskId) -> StoreResult<f64> {
        self.inner.get_duration(id).await
    }
    async fn soft_delete(&self, id: TaskId) -> StoreResult<bool> {
        self.inner.soft_delete(id).await
    }
    async fn list_pending(&self, limit: i64) -> StoreResult<Vec<Task>> {
        self.inner.list_pending(limit).await
    }
    async fn routing_backlog(&self, routing: &str) -> StoreResult<RoutingBacklog> {
        self.inner.routing_backlog(routing).await
    }
    async fn admit(&self, id: TaskId, routing: &str) -> StoreResult<bool> {
        self.inner.admit(id, routing).await
    }
}

struct Harness {
    lifecycle: Lifecycle,
    dispatch: DispatchQueue,
    faults: Arc<Faults>,
}

fn harness() -> Harness {
    let faults = Arc::new(Faults::default());
    let claims: Arc<dyn ClaimStore> = Arc::new(FlakyClaims {
        inner: MemoryClaimStore::new(),
        faults: Arc::clone(&faults),
    });
    let queue: Arc<dyn QueueStore> = Arc::new(FlakyQueue {
        inner: MemoryQueueStore::new(),
        faults: Arc::clone(&faults),
    });
    let dispatch = DispatchQueue::new(
        Arc::clone(&queue),
        DispatchConfig {
            pop_timeout: Duration::from_millis(20),
            low_water: 0,
        },
    );
    Harness {
        lifecycle: Lifecycle::new(claims, TaskMeta::new(queue)),
        dispatch,
        faults,
    }
}

fn form(duration: f64) -> CreateTaskForm {
    CreateTaskForm {
        source: TaskSource::fs("/media/in.mp4"),
        encoder: Default::default(),
        duration,
        file_size: 4096,
        settings: Default::default(),
    }
}

/// Submit, admit and claim a task for splitting, then enter encoding with
/// `parts` subtasks the way the split phase does.
async fn encoding_task(h: &Harness, parts: u32) -> Task {
    let task = h.lifecycle.submit(form(40.0)).await.unwrap();
    let store = h.lifecycle.store();
    assert!(store.admit(task.id, "cpu").await.unwrap());
    let claimed = store.claim_next(&ClaimRequest::split("node-a")).await.unwrap().unwrap();
    assert_eq!(claimed.id, task.id);

    h.lifecycle.meta().reset_for_split(&task.id).await.unwrap();
    h.lifecycle.meta().advance_progress(&task.id, progress::AFTER_SPLIT).await.unwrap();
    assert!(store.start_encoding(task.id, parts).await.unwrap());
    store.get(task.id).await.unwrap()
}

fn subtasks(task: &Task, parts: u32) -> Vec<Subtask> {
    (0..parts)
        .map(|part| {
            Subtask::new(
                task.id,
                part,
                parts,
                SubtaskPayload::Audio(AudioJob {
                    track: part,
                    codec: "aac".into(),
                    bitrate_kbps: 128,
                    duration: 10.0,
                }),
                "http://node-a:8080/v1/chunks",
                "http://node-a:8080/v1/tasks/x/parts",
            )
        })
        .collect()
}

fn report(task: &Task, part: u32) -> CompletionReport {
    CompletionReport {
        task_id: task.id,
        part,
        parts_total: 4,
        error: None,
    }
}

#[tokio::test]
async fn test_fan_in_completes_once_then_overflows() {
    let h = harness();
    let task = encoding_task(&h, 4).await;
    let fan_in = FanIn::new(h.lifecycle.clone());

    for part in 0..3 {
        let outcome = fan_in.report(&report(&task, part)).await.unwrap();
        assert_eq!(
            outcome,
            CompletionOutcome::Counted {
                count: i64::from(part) + 1,
                parts_total: 4
            }
        );
        assert_eq!(h.lifecycle.get(task.id).await.unwrap().status, TaskStatus::Encoding);
    }

    let outcome = fan_in.report(&report(&task, 3)).await.unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Completed {
            status: TaskStatus::WaitingAssembling
        }
    );
    assert_eq!(h.lifecycle.get(task.id).await.unwrap().status, TaskStatus::WaitingAssembling);
    assert_eq!(h.lifecycle.meta().progress(&task.id).await.unwrap(), progress::AFTER_ENCODING);

    // A duplicate delivery of part 3
    let outcome = fan_in.report(&report(&task, 3)).await.unwrap();
    assert_eq!(outcome, CompletionOutcome::Overflow { need: 4, actual: 5 });

    let stored = h.lifecycle.get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Error);
    let error = stored.error.unwrap();
    assert_eq!(error.reason, ErrorCode::ChunkOverflow);
    assert_eq!(error.meta("need"), Some("4"));
    assert_eq!(error.meta("actual"), Some("5"));
}

#[tokio::test]
async fn test_failed_subtask_fails_task_and_drops_queue() {
    let h = harness();
    let task = encoding_task(&h, 4).await;
    h.dispatch.enqueue("cpu", &subtasks(&task, 4)).await.unwrap();

    let first = match h.dispatch.dequeue("cpu").await.unwrap() {
        Dequeued::Subtask(s) => s,
        other => panic!("expected a subtask, got {other:?}"),
    };

    let fan_in = FanIn::new(h.lifecycle.clone());
    let error = TaskError::ffmpeg("CORRUPT_INPUT", "broken frame");
    let outcome = fan_in
        .report(&CompletionReport::failure(&first, error))
        .await
        .unwrap();
    assert_eq!(outcome, CompletionOutcome::Failed);
    assert_eq!(h.lifecycle.get(task.id).await.unwrap().status, TaskStatus::Error);

    // Remaining parts are discarded at dequeue
    for _ in 0..3 {
        assert_eq!(h.dispatch.dequeue("cpu").await.unwrap(), Dequeued::Skip);
    }
    assert_eq!(h.dispatch.dequeue("cpu").await.unwrap(), Dequeued::NoTasks);

    // Late success reports are ignored
    let outcome = fan_in.report(&report(&task, 1)).await.unwrap();
    assert_eq!(outcome, CompletionOutcome::Ignored);
}

#[tokio::test]
async fn test_cancel_discards_queued_subtasks() {
    let h = harness();
    let task = encoding_task(&h, 2).await;
    h.dispatch.enqueue("cpu", &subtasks(&task, 2)).await.unwrap();

    h.lifecycle.cancel(task.id).await.unwrap();

    assert_eq!(h.dispatch.dequeue("cpu").await.unwrap(), Dequeued::Skip);
    assert_eq!(h.dispatch.dequeue("cpu").await.unwrap(), Dequeued::Skip);
    assert_eq!(h.lifecycle.get(task.id).await.unwrap().status, TaskStatus::Canceled);
}

#[tokio::test]
async fn test_cancel_during_split_blocks_encoding() {
    let h = harness();
    let task = h.lifecycle.submit(form(40.0)).await.unwrap();
    let store = h.lifecycle.store();
    store.admit(task.id, "cpu").await.unwrap();
    store.claim_next(&ClaimRequest::split("node-a")).await.unwrap().unwrap();

    let watch = CancelWatch::spawn(
        Arc::clone(store),
        h.lifecycle.meta().clone(),
        task.id,
        Duration::from_millis(10),
    );
    let mut rx = watch.receiver();

    h.lifecycle.cancel(task.id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|c| *c))
        .await
        .unwrap()
        .unwrap();

    // The split phase must not move a canceled task into encoding
    assert!(!store.start_encoding(task.id, 3).await.unwrap());
    assert_eq!(h.lifecycle.get(task.id).await.unwrap().status, TaskStatus::Canceled);
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let h = harness();
    let task = encoding_task(&h, 4).await;
    let tracker = ProgressTracker::new(h.lifecycle.clone());

    let mut last = tracker.get(task.id).await.unwrap();
    assert_eq!(last, progress::AFTER_SPLIT);

    for delta_ms in [5_000, 0, -2_000, 10_000, 20_000, 30_000] {
        let now = tracker
            .report(&ProgressReport {
                task_id: task.id,
                delta_ms,
            })
            .await
            .unwrap();
        assert!(now >= last, "progress went from {last} to {now}");
        assert!(now <= progress::AFTER_ENCODING);
        last = now;
    }
    assert_eq!(last, progress::AFTER_ENCODING);

    // Finalization checkpoints keep moving forward; late deltas cannot pull back
    h.lifecycle.meta().advance_progress(&task.id, progress::AFTER_STITCH).await.unwrap();
    let after = tracker
        .report(&ProgressReport {
            task_id: task.id,
            delta_ms: 1_000,
        })
        .await
        .unwrap();
    assert_eq!(after, progress::AFTER_STITCH);
}

#[tokio::test]
async fn test_done_task_ignores_late_failures() {
    let h = harness();
    let task = encoding_task(&h, 1).await;
    let fan_in = FanIn::new(h.lifecycle.clone());

    let outcome = fan_in
        .report(&CompletionReport {
            task_id: task.id,
            part: 0,
            parts_total: 1,
            error: None,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, CompletionOutcome::Completed { .. }));

    let claimed = h
        .lifecycle
        .store()
        .claim_next(&ClaimRequest::assemble("node-a"))
        .await
        .unwrap()
        .unwrap();
    assert!(h.lifecycle.advance(&claimed, TaskStatus::Done).await.unwrap());

    h.lifecycle
        .fail(task.id, &TaskError::chunk_overflow(1, 2))
        .await
        .unwrap();
    assert_eq!(h.lifecycle.get(task.id).await.unwrap().status, TaskStatus::Done);
}

#[tokio::test]
async fn test_progress_write_failure_still_completes_fan_in() {
    let h = harness();
    let task = encoding_task(&h, 4).await;
    let fan_in = FanIn::new(h.lifecycle.clone());

    for part in 0..3 {
        fan_in.report(&report(&task, part)).await.unwrap();
    }

    Faults::set(&h.faults.set_max, true);
    let outcome = fan_in.report(&report(&task, 3)).await.unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Completed {
            status: TaskStatus::WaitingAssembling
        }
    );
    assert_eq!(h.lifecycle.get(task.id).await.unwrap().status, TaskStatus::WaitingAssembling);
    assert_eq!(h.lifecycle.meta().completed(&task.id).await.unwrap(), 4);
}

#[tokio::test]
async fn test_status_write_failure_reverts_count_for_resend() {
    let h = harness();
    let task = encoding_task(&h, 4).await;
    let fan_in = FanIn::new(h.lifecycle.clone());

    for part in 0..3 {
        fan_in.report(&report(&task, part)).await.unwrap();
    }

    Faults::set(&h.faults.update_status, true);
    assert!(fan_in.report(&report(&task, 3)).await.is_err());
    assert_eq!(h.lifecycle.meta().completed(&task.id).await.unwrap(), 3);
    assert_eq!(h.lifecycle.get(task.id).await.unwrap().status, TaskStatus::Encoding);

    // The worker resends the same report once the store is back.
    Faults::set(&h.faults.update_status, false);
    let outcome = fan_in.report(&report(&task, 3)).await.unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Completed {
            status: TaskStatus::WaitingAssembling
        }
    );
    assert_eq!(h.lifecycle.get(task.id).await.unwrap().status, TaskStatus::WaitingAssembling);
}

#[tokio::test]
async fn test_failed_status_write_still_stops_queued_work() {
    let h = harness();
    let task = encoding_task(&h, 2).await;
    h.dispatch.enqueue("cpu", &subtasks(&task, 2)).await.unwrap();

    Faults::set(&h.faults.update_status, true);
    let error = TaskError::ffmpeg("CORRUPT_INPUT", "broken frame");
    assert!(h.lifecycle.fail(task.id, &error).await.is_err());

    // The skip flag is written before the status, so queued parts are dropped.
    assert!(h.lifecycle.meta().is_skipped(&task.id).await.unwrap());
    assert_eq!(h.dispatch.dequeue("cpu").await.unwrap(), Dequeued::Skip);
    assert_eq!(h.dispatch.dequeue("cpu").await.unwrap(), Dequeued::Skip);
}

#[tokio::test]
async fn test_skip_check_failure_delivers_popped_subtask() {
    let h = harness();
    let task = encoding_task(&h, 2).await;
    h.dispatch.enqueue("cpu", &subtasks(&task, 2)).await.unwrap();

    Faults::set(&h.faults.exists, true);
    for part in 0..2 {
        match h.dispatch.dequeue("cpu").await.unwrap() {
            Dequeued::Subtask(s) => assert_eq!((s.task_id, s.part), (task.id, part)),
            other => panic!("expected part {part}, got {other:?}"),
        }
    }
    assert_eq!(h.dispatch.depth("cpu").await.unwrap(), 0);
}
