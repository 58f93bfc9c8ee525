//! Per-task values on the queue store: completion counter, skip flag,
//! progress and the encoded-time accumulator.

use std::sync::Arc;

use tracing::debug;
use trx_models::TaskId;

use crate::error::QueueResult;
use crate::keys;
use crate::store::QueueStore;

#[derive(Clone)]
pub struct TaskMeta {
    store: Arc<dyn QueueStore>,
}

impl TaskMeta {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Start of a split phase: zero the counter and accumulator, clear skip.
    pub async fn reset_for_split(&self, id: &TaskId) -> QueueResult<()> {
        self.store
            .set_with_ttl(&keys::counter(id), "0", keys::COUNTER_TTL)
            .await?;
        self.store
            .set_with_ttl(&keys::encoded_ms(id), "0", keys::PROGRESS_TTL)
            .await?;
        self.store.delete(&keys::skip(id)).await?;
        debug!(task_id = %id, "Reset task meta for split");
        Ok(())
    }

    pub async fn set_skip(&self, id: &TaskId) -> QueueResult<()> {
        self.store
            .set_with_ttl(&keys::skip(id), "true", keys::SKIP_TTL)
            .await
    }

    pub async fn is_skipped(&self, id: &TaskId) -> QueueResult<bool> {
        self.store.exists(&keys::skip(id)).await
    }

    /// Count one completion report; returns the new count.
    pub async fn incr_completed(&self, id: &TaskId) -> QueueResult<i64> {
        self.store.incr(&keys::counter(id)).await
    }

    /// Take back a counted report whose follow-up write failed, so the
    /// sender's retry is counted once. Returns the new count.
    pub async fn uncount_completed(&self, id: &TaskId) -> QueueResult<i64> {
        self.store
            .incr_by_with_ttl(&keys::counter(id), -1, keys::COUNTER_TTL)
            .await
    }

    pub async fn completed(&self, id: &TaskId) -> QueueResult<i64> {
        Ok(self
            .store
            .get(&keys::counter(id))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Advance progress; never moves it backwards. Returns the stored value.
    pub async fn advance_progress(&self, id: &TaskId, percent: i64) -> QueueResult<i64> {
        self.store
            .set_max_with_ttl(&keys::progress(id), percent.clamp(0, 100), keys::PROGRESS_TTL)
            .await
    }

    pub async fn progress(&self, id: &TaskId) -> QueueResult<i64> {
        Ok(self
            .store
            .get(&keys::progress(id))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Add encoded media time; returns the accumulated milliseconds.
    pub async fn add_encoded(&self, id: &TaskId, delta_ms: i64) -> QueueResult<i64> {
        self.store
            .incr_by_with_ttl(&keys::encoded_ms(id), delta_ms.max(0), keys::PROGRESS_TTL)
            .await
    }
}
