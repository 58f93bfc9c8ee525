//! In-process claim store for tests and single-node development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use trx_models::{CreateTaskForm, Task, TaskError, TaskId, TaskStatus};

use crate::claim::{ClaimRequest, ClaimStore, RoutingBacklog};
use crate::{StoreError, StoreResult};

/// Claim store backed by a mutex-guarded map. Claims are exclusive because
/// selection and update happen under one lock.
#[derive(Default)]
pub struct MemoryClaimStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task as-is, bypassing the pending state. Test seeding only.
    pub async fn insert(&self, task: Task) {
        self.tasks.lock().await.insert(task.id, task);
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn create(&self, form: CreateTaskForm) -> StoreResult<Task> {
        let task = Task::from_form(form);
        self.tasks.lock().await.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> StoreResult<Task> {
        self.tasks
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn claim_next(&self, request: &ClaimRequest) -> StoreResult<Option<Task>> {
        let mut tasks = self.tasks.lock().await;

        let candidate = tasks
            .values()
            .filter(|t| request.matches(t))
            .min_by(|a, b| {
                b.hostname
                    .len()
                    .cmp(&a.hostname.len())
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|t| t.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        task.status = request.claimed;
        task.hostname = request.hostname.clone();
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error: Option<&TaskError>,
    ) -> StoreResult<bool> {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(&id) {
            Some(task) if task.status != TaskStatus::Done => {
                task.status = status;
                if let Some(error) = error {
                    task.error = Some(error.clone());
                }
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn start_encoding(&self, id: TaskId, parts_total: u32) -> StoreResult<bool> {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Splitting && !task.is_deleted() => {
                task.status = TaskStatus::Encoding;
                task.parts_total = Some(parts_total);
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_canceled(&self, id: TaskId) -> StoreResult<bool> {
        let tasks = self.tasks.lock().await;
        let task = tasks.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(task.is_deleted() || task.status == TaskStatus::Canceled)
    }

    async fn get_duration(&self, id: TaskId) -> StoreResult<f64> {
        let tasks = self.tasks.lock().await;
        tasks
            .get(&id)
            .map(|t| t.duration)
            .ok_or(StoreError::NotFound(id))
    }

    async fn soft_delete(&self, id: TaskId) -> StoreResult<bool> {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(&id) {
            Some(task) if task.deleted_at.is_none() => {
                let now = Utc::now();
                task.deleted_at = Some(now);
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_pending(&self, limit: i64) -> StoreResult<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        let mut pending: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && !t.is_deleted())
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn routing_backlog(&self, routing: &str) -> StoreResult<RoutingBacklog> {
        let tasks = self.tasks.lock().await;
        let backlog = tasks
            .values()
            .filter(|t| {
                t.routing == routing
                    && !t.is_deleted()
                    && matches!(t.status, TaskStatus::WaitingSplitting | TaskStatus::Splitting)
            })
            .fold(RoutingBacklog::default(), |mut acc, t| {
                acc.tasks += 1;
                acc.duration += t.duration;
                acc.file_size += t.file_size;
                acc
            });
        Ok(backlog)
    }

    async fn admit(&self, id: TaskId, routing: &str) -> StoreResult<bool> {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending && !task.is_deleted() => {
                task.status = TaskStatus::WaitingSplitting;
                task.routing = routing.to_string();
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use trx_models::{EncoderKind, TaskSource};

    fn form() -> CreateTaskForm {
        CreateTaskForm {
            source: TaskSource::fs("/media/in.mov"),
            encoder: EncoderKind::Auto,
            duration: 42.0,
            file_size: 2048,
            settings: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_exclusive_claim_among_concurrent_claimants() {
        let store = Arc::new(MemoryClaimStore::new());
        let task = store.create(form()).await.unwrap();
        store.admit(task.id, "cpu").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim_next(&ClaimRequest::split(format!("host-{i}")))
                    .await
                    .unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(store.get(task.id).await.unwrap().status, TaskStatus::Splitting);
    }

    #[tokio::test]
    async fn test_bound_rows_claimed_first() {
        let store = MemoryClaimStore::new();
        let unbound = store.create(form()).await.unwrap();
        store.admit(unbound.id, "cpu").await.unwrap();

        let mut bound = Task::from_form(form());
        bound.status = TaskStatus::WaitingSplitting;
        bound.hostname = "node-a".into();
        store.insert(bound.clone()).await;

        let first = store
            .claim_next(&ClaimRequest::split("node-a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, bound.id);

        let second = store
            .claim_next(&ClaimRequest::split("node-a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, unbound.id);
        assert_eq!(second.hostname, "node-a");
    }

    #[tokio::test]
    async fn test_done_rejects_writes() {
        let store = MemoryClaimStore::new();
        let task = store.create(form()).await.unwrap();

        assert!(store.update_status(task.id, TaskStatus::Done, None).await.unwrap());
        for status in TaskStatus::ALL {
            assert!(!store.update_status(task.id, status, None).await.unwrap());
        }
        assert_eq!(store.get(task.id).await.unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_cancel_detection() {
        let store = MemoryClaimStore::new();
        let task = store.create(form()).await.unwrap();
        assert!(!store.is_canceled(task.id).await.unwrap());

        assert!(store.soft_delete(task.id).await.unwrap());
        assert!(!store.soft_delete(task.id).await.unwrap());
        assert!(store.is_canceled(task.id).await.unwrap());

        let missing = store.is_canceled(TaskId::new()).await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_admission_and_backlog() {
        let store = MemoryClaimStore::new();
        let a = store.create(form()).await.unwrap();
        let b = store.create(form()).await.unwrap();

        assert_eq!(store.list_pending(10).await.unwrap().len(), 2);
        assert!(store.admit(a.id, "cpu").await.unwrap());
        assert!(!store.admit(a.id, "cpu").await.unwrap());

        let backlog = store.routing_backlog("cpu").await.unwrap();
        assert_eq!(backlog.tasks, 1);
        assert_eq!(backlog.duration, 42.0);
        assert_eq!(backlog.file_size, 2048);

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }

    #[tokio::test]
    async fn test_start_encoding_requires_splitting() {
        let store = MemoryClaimStore::new();
        let task = store.create(form()).await.unwrap();
        assert!(!store.start_encoding(task.id, 3).await.unwrap());

        store.admit(task.id, "cpu").await.unwrap();
        store.claim_next(&ClaimRequest::split("h")).await.unwrap();
        assert!(store.start_encoding(task.id, 3).await.unwrap());

        let task = store.get(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Encoding);
        assert_eq!(task.parts_total, Some(3));
    }
}
