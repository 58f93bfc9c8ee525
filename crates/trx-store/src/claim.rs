//! The claim store contract.

use async_trait::async_trait;
use serde::Serialize;
use trx_models::{CreateTaskForm, Task, TaskError, TaskId, TaskStatus};

use crate::StoreResult;

/// How a claim treats the row's hostname binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// Rows bound to the claimant come first, unbound rows are eligible too.
    /// The claimed row is bound to the claimant.
    Prefer,
    /// Only rows already bound to the claimant are eligible.
    Require,
}

/// Parameters of one atomic claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Status a row must have to be claimable
    pub eligible: TaskStatus,
    /// Status written by the claim
    pub claimed: TaskStatus,
    pub hostname: String,
    pub affinity: Affinity,
}

impl ClaimRequest {
    /// Claim for the split phase.
    pub fn split(hostname: impl Into<String>) -> Self {
        Self {
            eligible: TaskStatus::WaitingSplitting,
            claimed: TaskStatus::Splitting,
            hostname: hostname.into(),
            affinity: Affinity::Prefer,
        }
    }

    /// Claim for the assemble phase. Encoded parts live on the host that
    /// split the task, so only tasks bound to this host qualify.
    pub fn assemble(hostname: impl Into<String>) -> Self {
        Self {
            eligible: TaskStatus::WaitingAssembling,
            claimed: TaskStatus::Assembling,
            hostname: hostname.into(),
            affinity: Affinity::Require,
        }
    }

    /// Whether `task` may be claimed by this request.
    pub fn matches(&self, task: &Task) -> bool {
        if task.status != self.eligible || task.is_deleted() {
            return false;
        }
        match self.affinity {
            Affinity::Prefer => task.hostname.is_empty() || task.hostname == self.hostname,
            Affinity::Require => task.hostname == self.hostname,
        }
    }
}

/// Admission backlog of a routing class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RoutingBacklog {
    pub tasks: i64,
    pub duration: f64,
    pub file_size: i64,
}

/// Relational store holding one row per task.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Insert a new pending task.
    async fn create(&self, form: CreateTaskForm) -> StoreResult<Task>;

    /// Fetch a task, including soft-deleted ones.
    async fn get(&self, id: TaskId) -> StoreResult<Task>;

    /// Atomically claim one eligible row, skipping rows locked by other
    /// claimants. Returns `None` when nothing is eligible.
    async fn claim_next(&self, request: &ClaimRequest) -> StoreResult<Option<Task>>;

    /// Write a new status (and error, if given). Never overwrites `done`;
    /// returns whether a row was updated.
    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error: Option<&TaskError>,
    ) -> StoreResult<bool>;

    /// Move a task from `splitting` to `encoding`, recording its parts total.
    /// Returns `false` if the task is no longer splitting or was deleted.
    async fn start_encoding(&self, id: TaskId, parts_total: u32) -> StoreResult<bool>;

    /// True if the task was soft-deleted or canceled.
    async fn is_canceled(&self, id: TaskId) -> StoreResult<bool>;

    /// Source duration in seconds.
    async fn get_duration(&self, id: TaskId) -> StoreResult<f64>;

    /// Set the soft-delete marker. Returns `false` if already deleted.
    async fn soft_delete(&self, id: TaskId) -> StoreResult<bool>;

    /// Pending tasks, oldest first.
    async fn list_pending(&self, limit: i64) -> StoreResult<Vec<Task>>;

    /// Tasks admitted to `routing` that have not finished splitting.
    async fn routing_backlog(&self, routing: &str) -> StoreResult<RoutingBacklog>;

    /// Move a pending task to `waiting-splitting` under `routing`.
    /// Returns `false` if the task was not pending anymore.
    async fn admit(&self, id: TaskId, routing: &str) -> StoreResult<bool>;
}
