//! Transcoding coordinator.
//!
//! This crate provides:
//! - The task lifecycle: submission, admission, cancellation and deletion
//! - Split and assemble phases driven by claim-based watcher/worker pools
//! - Completion fan-in and progress accounting for worker reports
//! - The axum HTTP surface: public task API and internal worker RPC

pub mod admission;
pub mod assembler;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod fan_in;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod middleware;
pub mod phase;
pub mod planner;
pub mod progress;
pub mod routes;
pub mod service;
pub mod splitter;
pub mod state;
pub mod validate;
pub mod workdir;

pub use config::ComposerConfig;
pub use error::{ApiError, ApiResult, ComposerError, ComposerResult};
pub use fan_in::FanIn;
pub use lifecycle::{CancelOutcome, Lifecycle};
pub use progress::ProgressTracker;
pub use routes::create_router;
pub use service::ComposerService;
pub use state::AppState;
