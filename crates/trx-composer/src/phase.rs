//! Watcher/worker pools that drive a phase.
//!
//! Watchers claim tasks from the claim store and hand them to workers over
//! a channel. A watcher takes an idle-worker permit before it claims and the
//! permit travels with the task, so claimed tasks never outnumber workers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use trx_models::Task;
use trx_store::{ClaimRequest, ClaimStore};

use crate::config::PoolConfig;
use crate::metrics;

/// One phase of the pipeline (split or assemble).
#[async_trait]
pub trait Phase: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// What this phase claims.
    fn claim_request(&self) -> ClaimRequest;

    /// Process a claimed task to its next state. Failures are recorded on
    /// the task by the phase itself.
    async fn process(&self, task: Task);
}

pub struct PhasePool<P: Phase> {
    phase: Arc<P>,
    store: Arc<dyn ClaimStore>,
    config: PoolConfig,
}

impl<P: Phase> PhasePool<P> {
    pub fn new(phase: Arc<P>, store: Arc<dyn ClaimStore>, config: PoolConfig) -> Self {
        Self { phase, store, config }
    }

    /// Run until `shutdown` flips. Watchers stop first; workers then drain
    /// whatever was already handed to them.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let name = self.phase.name();
        info!(
            phase = name,
            watchers = self.config.watchers,
            workers = self.config.workers,
            "Starting phase pool"
        );

        let worker_count = self.config.workers.max(1);
        let idle = Arc::new(Semaphore::new(worker_count));
        let (tx, rx) = mpsc::channel::<(Task, OwnedSemaphorePermit)>(worker_count);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();

        for _ in 0..worker_count {
            let rx = Arc::clone(&rx);
            let phase = Arc::clone(&self.phase);
            workers.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((task, permit)) = next else { break };
                    phase.process(task).await;
                    drop(permit);
                }
            });
        }

        let mut watchers = JoinSet::new();
        for _ in 0..self.config.watchers.max(1) {
            watchers.spawn(watch_loop(
                Arc::clone(&self.phase),
                Arc::clone(&self.store),
                self.config,
                Arc::clone(&idle),
                tx.clone(),
                shutdown.clone(),
            ));
        }
        drop(tx);

        while watchers.join_next().await.is_some() {}
        debug!(phase = name, "Watchers stopped, draining workers");
        while workers.join_next().await.is_some() {}
        info!(phase = name, "Phase pool stopped");
    }
}

async fn watch_loop<P: Phase>(
    phase: Arc<P>,
    store: Arc<dyn ClaimStore>,
    config: PoolConfig,
    idle: Arc<Semaphore>,
    tx: mpsc::Sender<(Task, OwnedSemaphorePermit)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let request = phase.claim_request();

    loop {
        let permit = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            permit = Arc::clone(&idle).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let pause = match store.claim_next(&request).await {
            Ok(Some(task)) => {
                info!(task_id = %task.id, phase = phase.name(), "Claimed task");
                metrics::record_claimed(phase.name());
                // Capacity equals the permit count, so this never waits.
                if let Err(e) = tx.send((task, permit)).await {
                    let (task, _) = e.0;
                    warn!(task_id = %task.id, phase = phase.name(), "Workers gone, claimed task dropped");
                    break;
                }
                continue;
            }
            Ok(None) => config.tick,
            Err(e) => {
                warn!(phase = phase.name(), error = %e, "Claim failed");
                config.backoff
            }
        };

        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Resolves once the flag is set or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
