//! Request handlers.

pub mod dispatch;
pub mod files;
pub mod health;
pub mod tasks;

pub use dispatch::*;
pub use files::*;
pub use health::*;
pub use tasks::*;

use trx_models::TaskId;

use crate::error::ApiError;

/// Parse a task ID path segment.
pub(crate) fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid task id: {raw}")))
}
