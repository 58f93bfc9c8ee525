//! In-process queue store for tests and single-node development.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::QueueResult;
use crate::store::QueueStore;

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, Entry>,
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl State {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .values
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }

    fn int(&mut self, key: &str) -> i64 {
        self.live(key)
            .and_then(|e| e.value.parse().ok())
            .unwrap_or(0)
    }

    fn put(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = match ttl {
            Some(ttl) => Some(Instant::now() + ttl),
            None => self.live(key).and_then(|e| e.expires_at),
        };
        self.values
            .insert(key.to_string(), Entry { value, expires_at });
    }
}

/// Queue store kept in process memory. TTLs are honored lazily on read.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn push(&self, key: &str, value: &str) -> QueueResult<()> {
        self.state
            .lock()
            .await
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop_any(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> QueueResult<Option<(String, String)>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking so a push between check and wait is not lost.
            let pushed = self.pushed.notified();
            {
                let mut state = self.state.lock().await;
                for key in keys {
                    if let Some(value) = state.lists.get_mut(key).and_then(VecDeque::pop_front) {
                        return Ok(Some((key.clone(), value)));
                    }
                }
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self, key: &str) -> QueueResult<u64> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn incr(&self, key: &str) -> QueueResult<i64> {
        let mut state = self.state.lock().await;
        let value = state.int(key) + 1;
        state.put(key, value.to_string(), None);
        Ok(value)
    }

    async fn incr_by_with_ttl(&self, key: &str, by: i64, ttl: Duration) -> QueueResult<i64> {
        let mut state = self.state.lock().await;
        let value = state.int(key) + by;
        state.put(key, value.to_string(), Some(ttl));
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()> {
        self.state
            .lock()
            .await
            .put(key, value.to_string(), Some(ttl));
        Ok(())
    }

    async fn set_max_with_ttl(&self, key: &str, value: i64, ttl: Duration) -> QueueResult<i64> {
        let mut state = self.state.lock().await;
        let current = state
            .live(key)
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(-1);
        let held = current.max(value);
        state.put(key, held.to_string(), Some(ttl));
        Ok(held)
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state.live(key).map(|e| e.value.clone()))
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let is_list = state.lists.get(key).is_some_and(|l| !l.is_empty());
        Ok(is_list || state.live(key).is_some())
    }

    async fn delete(&self, key: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.values.remove(key);
        state.lists.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pop_prefers_key_order() {
        let store = MemoryQueueStore::new();
        store.push("b", "2").await.unwrap();
        store.push("a", "1").await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string()];
        let popped = store
            .blocking_pop_any(&keys, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(popped, Some(("a".to_string(), "1".to_string())));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let store = Arc::new(MemoryQueueStore::new());
        let keys = vec!["q".to_string()];

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.blocking_pop_any(&keys, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push("q", "payload").await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.map(|(_, v)| v), Some("payload".to_string()));
    }

    #[tokio::test]
    async fn test_pop_times_out() {
        let store = MemoryQueueStore::new();
        let popped = store
            .blocking_pop_any(&["empty".to_string()], Duration::from_millis(20))
            .await
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryQueueStore::new();
        store
            .set_with_ttl("flag", "true", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(store.exists("flag").await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.exists("flag").await.unwrap());
    }

    #[tokio::test]
    async fn test_counters() {
        let store = MemoryQueueStore::new();
        let ttl = Duration::from_secs(60);
        store.set_with_ttl("c", "0", ttl).await.unwrap();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr_by_with_ttl("c", 41, ttl).await.unwrap(), 42);
        assert_eq!(store.set_max_with_ttl("c", 10, ttl).await.unwrap(), 42);
        assert_eq!(store.set_max_with_ttl("c", 50, ttl).await.unwrap(), 50);
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("50"));
    }
}
