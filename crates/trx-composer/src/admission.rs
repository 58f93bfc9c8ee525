//! Admission of pending tasks into routing classes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use trx_models::{EncoderKind, Task};
use trx_queue::PopulateHook;
use trx_store::{ClaimStore, RoutingBacklog};

use crate::error::ComposerResult;
use crate::metrics;
use crate::phase::stopped;

/// Pending tasks inspected per admission round.
const ADMISSION_BATCH: i64 = 100;

/// Picks the routing class (dispatch queue) of a task.
pub trait RoutingPolicy: Send + Sync {
    fn route(&self, task: &Task) -> String;
}

/// Routes by encoder class: GPU tasks to `gpu`, everything else to `cpu`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EncoderRouting;

impl RoutingPolicy for EncoderRouting {
    fn route(&self, task: &Task) -> String {
        match task.encoder {
            EncoderKind::Gpu => "gpu",
            EncoderKind::Auto | EncoderKind::Cpu => "cpu",
        }
        .to_string()
    }
}

/// Per routing class limits on work waiting for or in the split phase.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
    pub max_tasks: i64,
    /// Summed source duration in seconds
    pub max_duration: f64,
    /// Summed source size in bytes
    pub max_file_size: i64,
}

impl AdmissionLimits {
    /// Whether `task` fits on top of `backlog`. An empty class always
    /// accepts one task, however long or large.
    pub fn allows(&self, backlog: &RoutingBacklog, task: &Task) -> bool {
        if backlog.tasks >= self.max_tasks {
            return false;
        }
        backlog.tasks == 0
            || (backlog.duration + task.duration <= self.max_duration
                && backlog.file_size + task.file_size <= self.max_file_size)
    }
}

/// Wakes the admitter when a routing class runs low on queued subtasks.
#[derive(Clone)]
pub struct AdmissionWaker {
    notify: Arc<Notify>,
}

impl PopulateHook for AdmissionWaker {
    fn on_low_water(&self, routing: &str) {
        debug!(routing, "Dispatch queue low, waking admitter");
        self.notify.notify_one();
    }
}

/// Moves pending tasks to `waiting-splitting`, assigning each a routing key.
pub struct Admitter {
    store: Arc<dyn ClaimStore>,
    policy: Arc<dyn RoutingPolicy>,
    limits: AdmissionLimits,
    interval: Duration,
    notify: Arc<Notify>,
}

impl Admitter {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        policy: Arc<dyn RoutingPolicy>,
        limits: AdmissionLimits,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            policy,
            limits,
            interval,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn waker(&self) -> AdmissionWaker {
        AdmissionWaker {
            notify: Arc::clone(&self.notify),
        }
    }

    /// One admission round; returns how many tasks were admitted.
    pub async fn admit_once(&self) -> ComposerResult<usize> {
        let pending = self.store.list_pending(ADMISSION_BATCH).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut backlogs: HashMap<String, RoutingBacklog> = HashMap::new();
        let mut admitted = 0;

        for task in pending {
            let routing = self.policy.route(&task);
            if !backlogs.contains_key(&routing) {
                let backlog = self.store.routing_backlog(&routing).await?;
                metrics::set_routing_backlog(&routing, backlog.tasks);
                backlogs.insert(routing.clone(), backlog);
            }
            let Some(backlog) = backlogs.get_mut(&routing) else {
                continue;
            };

            if !self.limits.allows(backlog, &task) {
                debug!(task_id = %task.id, routing = %routing, "Routing class full, task stays pending");
                continue;
            }

            if self.store.admit(task.id, &routing).await? {
                backlog.tasks += 1;
                backlog.duration += task.duration;
                backlog.file_size += task.file_size;
                admitted += 1;
                metrics::record_admitted(&routing);
                info!(task_id = %task.id, routing = %routing, "Task admitted");
            }
        }

        Ok(admitted)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "Starting admitter");

        loop {
            if let Err(e) = self.admit_once().await {
                warn!(error = %e, "Admission round failed");
            }

            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.notify.notified() => {}
            }
        }
        info!("Admitter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trx_models::{CreateTaskForm, TaskSource, TaskStatus};
    use trx_store::MemoryClaimStore;

    fn form(encoder: EncoderKind, duration: f64) -> CreateTaskForm {
        sized_form(encoder, duration, 1)
    }

    fn sized_form(encoder: EncoderKind, duration: f64, file_size: i64) -> CreateTaskForm {
        CreateTaskForm {
            source: TaskSource::fs("/in.mp4"),
            encoder,
            duration,
            file_size,
            settings: Default::default(),
        }
    }

    fn limits(max_tasks: i64, max_duration: f64) -> AdmissionLimits {
        AdmissionLimits {
            max_tasks,
            max_duration,
            max_file_size: i64::MAX,
        }
    }

    fn admitter(store: Arc<dyn ClaimStore>, limits: AdmissionLimits) -> Admitter {
        Admitter::new(store, Arc::new(EncoderRouting), limits, Duration::from_secs(5))
    }

    #[test]
    fn test_limits_accept_one_long_task_into_empty_class() {
        let limits = limits(10, 60.0);
        let task = Task::from_form(form(EncoderKind::Auto, 600.0));
        assert!(limits.allows(&RoutingBacklog::default(), &task));

        let busy = RoutingBacklog {
            tasks: 1,
            duration: 10.0,
            file_size: 1,
        };
        assert!(!limits.allows(&busy, &task));
    }

    #[tokio::test]
    async fn test_admission_routes_by_encoder() {
        let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
        let cpu = store.create(form(EncoderKind::Auto, 10.0)).await.unwrap();
        let gpu = store.create(form(EncoderKind::Gpu, 10.0)).await.unwrap();

        let admitter = admitter(store.clone(), limits(10, 3600.0));
        assert_eq!(admitter.admit_once().await.unwrap(), 2);

        let cpu = store.get(cpu.id).await.unwrap();
        assert_eq!(cpu.status, TaskStatus::WaitingSplitting);
        assert_eq!(cpu.routing, "cpu");
        assert_eq!(store.get(gpu.id).await.unwrap().routing, "gpu");
    }

    #[tokio::test]
    async fn test_admission_respects_task_limit() {
        let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
        for _ in 0..3 {
            store.create(form(EncoderKind::Cpu, 10.0)).await.unwrap();
        }

        let admitter = admitter(store.clone(), limits(2, 3600.0));
        assert_eq!(admitter.admit_once().await.unwrap(), 2);
        assert_eq!(admitter.admit_once().await.unwrap(), 0);
        assert_eq!(store.list_pending(10).await.unwrap().len(), 1);
    }

    #[test]
    fn test_limits_bound_backlog_file_size() {
        let limits = AdmissionLimits {
            max_file_size: 1000,
            ..limits(10, 3600.0)
        };
        let busy = RoutingBacklog {
            tasks: 1,
            duration: 10.0,
            file_size: 800,
        };
        assert!(limits.allows(&busy, &Task::from_form(sized_form(EncoderKind::Cpu, 10.0, 200))));
        assert!(!limits.allows(&busy, &Task::from_form(sized_form(EncoderKind::Cpu, 10.0, 201))));
        // An empty class still takes an oversized task.
        assert!(limits.allows(
            &RoutingBacklog::default(),
            &Task::from_form(sized_form(EncoderKind::Cpu, 10.0, 5000))
        ));
    }

    #[tokio::test]
    async fn test_admission_respects_file_size_limit() {
        let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
        for _ in 0..3 {
            store.create(sized_form(EncoderKind::Cpu, 10.0, 400)).await.unwrap();
        }

        let admitter = admitter(
            store.clone(),
            AdmissionLimits {
                max_file_size: 1000,
                ..limits(10, 3600.0)
            },
        );
        assert_eq!(admitter.admit_once().await.unwrap(), 2);
        assert_eq!(store.list_pending(10).await.unwrap().len(), 1);
    }
}
