//! Key namespace on the queue store.

use std::time::Duration;

use trx_models::TaskId;

/// Shard lists per routing class.
pub const SHARDS: usize = 10;

pub const COUNTER_TTL: Duration = Duration::from_secs(24 * 3600);
pub const SKIP_TTL: Duration = Duration::from_secs(24 * 3600);
pub const PROGRESS_TTL: Duration = Duration::from_secs(12 * 3600);

pub fn counter(id: &TaskId) -> String {
    format!("trx:task:{id}:counter")
}

pub fn skip(id: &TaskId) -> String {
    format!("trx:task:{id}:skip")
}

pub fn progress(id: &TaskId) -> String {
    format!("trx:task:{id}:progress")
}

pub fn encoded_ms(id: &TaskId) -> String {
    format!("trx:task:{id}:encoded_ms")
}

pub fn queue_shard(routing: &str, shard: usize) -> String {
    format!("trx:queue:{routing}:{shard}")
}

/// All shard keys of a routing class, in shard order.
pub fn queue_shards(routing: &str) -> Vec<String> {
    (0..SHARDS).map(|shard| queue_shard(routing, shard)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let id: TaskId = "7d7b0b5e-33a4-4e8e-9d39-8a3f4bb2a6f1".parse().unwrap();
        assert_eq!(counter(&id), "trx:task:7d7b0b5e-33a4-4e8e-9d39-8a3f4bb2a6f1:counter");
        assert_eq!(queue_shard("gpu", 3), "trx:queue:gpu:3");
        assert_eq!(queue_shards("cpu").len(), SHARDS);
    }
}
