//! Queue store, sharded dispatch queue and per-task counters.
//!
//! This crate provides:
//! - The `QueueStore` contract with Redis and in-memory implementations
//! - `DispatchQueue`: subtask lists sharded per routing class
//! - `TaskMeta`: completion counter, skip flag and progress values

pub mod dispatch;
pub mod error;
pub mod keys;
pub mod memory;
pub mod meta;
pub mod redis_store;
pub mod store;

pub use dispatch::{DispatchConfig, DispatchQueue, Dequeued, NoopPopulate, PopulateHook};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueueStore;
pub use meta::TaskMeta;
pub use redis_store::RedisQueueStore;
pub use store::QueueStore;
