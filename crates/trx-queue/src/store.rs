//! The queue store contract.

use std::time::Duration;

use async_trait::async_trait;

use crate::QueueResult;

/// Cache/queue store: lists with blocking pop, counters and TTL values.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append to the tail of a list.
    async fn push(&self, key: &str, value: &str) -> QueueResult<()>;

    /// Pop the head of the first non-empty list among `keys`, waiting up to
    /// `timeout`. Returns the key it popped from and the value.
    async fn blocking_pop_any(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> QueueResult<Option<(String, String)>>;

    /// Length of a list.
    async fn len(&self, key: &str) -> QueueResult<u64>;

    /// Increment an integer, keeping any existing TTL.
    async fn incr(&self, key: &str) -> QueueResult<i64>;

    /// Increment an integer by `by` and (re)set its TTL.
    async fn incr_by_with_ttl(&self, key: &str, by: i64, ttl: Duration) -> QueueResult<i64>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()>;

    /// Atomically store `value` if it is greater than the current integer
    /// value (or the key is missing). Returns the value held afterwards.
    async fn set_max_with_ttl(&self, key: &str, value: i64, ttl: Duration) -> QueueResult<i64>;

    async fn get(&self, key: &str) -> QueueResult<Option<String>>;

    async fn exists(&self, key: &str) -> QueueResult<bool>;

    async fn delete(&self, key: &str) -> QueueResult<()>;
}
