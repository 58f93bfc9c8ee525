//! Transcoding worker.
//!
//! This crate provides:
//! - A client for the composer's dispatch, progress, completion and file endpoints
//! - Weighted admission of subtasks onto CPU slots
//! - The executor that prefetches, encodes, uploads and reports each subtask
//! - Work dir reset at startup and periodic cleanup

pub mod cleanup;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod scheduler;

pub use client::ComposerClient;
pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::SubtaskExecutor;
pub use logging::SubtaskLogger;
pub use scheduler::{AdmissionScheduler, CodecCostTable, CostModel};

use tokio::sync::watch;

/// Resolves once `rx` reads `true`. Never resolves if the sender is dropped
/// first.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|v| *v).await.is_err() {
        std::future::pending::<()>().await;
    }
}
