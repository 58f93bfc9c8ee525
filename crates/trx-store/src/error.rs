//! Claim store error types.

use thiserror::Error;
use trx_models::TaskId;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Corrupt row for task {id}: {message}")]
    Corrupt { id: TaskId, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn corrupt(id: TaskId, message: impl Into<String>) -> Self {
        Self::Corrupt {
            id,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
