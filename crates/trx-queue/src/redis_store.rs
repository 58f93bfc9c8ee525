//! Redis implementation of the queue store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::info;

use crate::error::{QueueError, QueueResult};
use crate::store::QueueStore;

const SET_MAX_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '-1')
local value = tonumber(ARGV[1])
if value > current then
    redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
    return value
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
return current
"#;

/// Queue store on Redis (or any RESP-compatible server).
///
/// Commands share one multiplexed connection opened at construction.
#[derive(Clone)]
pub struct RedisQueueStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    set_max: redis::Script,
}

impl RedisQueueStore {
    /// Open the shared connection and verify the server answers.
    pub async fn connect(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;
        info!(reply = %pong, "Connected to queue store");

        Ok(Self {
            client,
            conn,
            set_max: redis::Script::new(SET_MAX_SCRIPT),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn push(&self, key: &str, value: &str) -> QueueResult<()> {
        let mut conn = self.conn();
        conn.rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn blocking_pop_any(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> QueueResult<Option<(String, String)>> {
        if keys.is_empty() {
            return Ok(None);
        }
        // BLPOP holds its connection until it returns, so it gets its own
        // instead of stalling the shared one.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(keys)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(popped)
    }

    async fn len(&self, key: &str) -> QueueResult<u64> {
        let mut conn = self.conn();
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn incr(&self, key: &str) -> QueueResult<i64> {
        let mut conn = self.conn();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn incr_by_with_ttl(&self, key: &str, by: i64, ttl: Duration) -> QueueResult<i64> {
        let mut conn = self.conn();
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, by)
            .expire(key, ttl_secs(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()> {
        let mut conn = self.conn();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn set_max_with_ttl(&self, key: &str, value: i64, ttl: Duration) -> QueueResult<i64> {
        let mut conn = self.conn();
        let held: i64 = self
            .set_max
            .key(key)
            .arg(value)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(held)
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> QueueResult<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
