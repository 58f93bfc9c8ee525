//! Subtask executor.
//!
//! Watchers pull subtasks from the composer and prefetch their sources into
//! a bounded backlog. The scheduling loop places each prefetched subtask on
//! a slot and runs it; every dispatched subtask ends in exactly one
//! completion report unless the composer has already discarded its task.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use trx_media::progress;
use trx_media::{DeltaThrottle, FfmpegProgress, ProgressSink, TranscodeExecutor, TranscodeRequest};
use trx_models::{CompletionReport, DispatchResponse, Subtask, SubtaskPayload, TaskError};

use crate::client::ComposerClient;
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::SubtaskLogger;
use crate::metrics;
use crate::retry::FailureTracker;
use crate::scheduler::{Admission, AdmissionScheduler};
use crate::stopped;

/// Pause after an empty dispatch.
pub const NO_TASKS_BACKOFF: Duration = Duration::from_secs(3);
/// Pause while the composer is unreachable or shedding load.
pub const UNAVAILABLE_BACKOFF: Duration = Duration::from_secs(10);
/// Pause after any other dispatch error.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);

const OUTPUT_DIR: &str = "out";

/// A dispatched subtask whose source is on local disk.
#[derive(Debug)]
pub struct Prefetched {
    pub subtask: Subtask,
    /// `{work_dir}/{task_id}/{part}`
    pub dir: PathBuf,
    pub input: PathBuf,
}

/// How a subtask run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed,
    /// The composer discarded the task; nothing was reported
    Gone,
    /// Interrupted by shutdown; reported as a worker reset
    Reset,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed => "failed",
            RunOutcome::Gone => "gone",
            RunOutcome::Reset => "reset",
        }
    }
}

/// File extension of a subtask source URL, `mp4` when none is recognizable.
pub fn source_extension(url: &str) -> &str {
    url.rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("mp4")
}

pub struct SubtaskExecutor {
    config: Arc<WorkerConfig>,
    client: ComposerClient,
    scheduler: Arc<AdmissionScheduler>,
    transcoder: Arc<dyn TranscodeExecutor>,
    shutdown: watch::Sender<bool>,
}

impl SubtaskExecutor {
    pub fn new(
        config: Arc<WorkerConfig>,
        client: ComposerClient,
        scheduler: Arc<AdmissionScheduler>,
        transcoder: Arc<dyn TranscodeExecutor>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            client,
            scheduler,
            transcoder,
            shutdown,
        }
    }

    /// Stop pulling work. Running subtasks get `shutdown_timeout` to finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn run(self: Arc<Self>) -> WorkerResult<()> {
        let slots = self.scheduler.slots().len();
        info!(
            worker_id = %self.client.identity().worker_id,
            routing = %self.config.routing,
            slots,
            max_tasks_per_slot = self.config.max_tasks_per_slot,
            "Starting subtask executor"
        );

        let (backlog_tx, mut backlog_rx) = mpsc::channel::<Prefetched>(slots);
        let mut watchers = JoinSet::new();
        for index in 0..slots {
            let executor = Arc::clone(&self);
            let tx = backlog_tx.clone();
            watchers.spawn(async move { executor.watch(index, tx).await });
        }
        drop(backlog_tx);

        // Flipped once the grace period after shutdown runs out.
        let (abort_tx, abort_rx) = watch::channel(false);
        let mut jobs = JoinSet::new();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let prefetched = tokio::select! {
                _ = stopped(&mut shutdown) => break,
                next = backlog_rx.recv() => match next {
                    Some(p) => p,
                    None => break,
                },
            };

            match self.scheduler.admit(&prefetched.subtask, &mut shutdown).await {
                Some(admission) => {
                    let executor = Arc::clone(&self);
                    let abort = abort_rx.clone();
                    jobs.spawn(async move { executor.run_job(prefetched, admission, abort).await });
                }
                None => {
                    self.abandon(prefetched).await;
                    break;
                }
            }
        }

        info!("Shutdown signal received, draining backlog");
        backlog_rx.close();
        while let Some(prefetched) = backlog_rx.recv().await {
            self.abandon(prefetched).await;
        }
        while watchers.join_next().await.is_some() {}

        info!(running = jobs.len(), "Waiting for running subtasks");
        let drain = async {
            while jobs.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain).await.is_err() {
            warn!(running = jobs.len(), "Shutdown timeout, cancelling running subtasks");
            let _ = abort_tx.send(true);
            while jobs.join_next().await.is_some() {}
        }

        info!("Subtask executor stopped");
        Ok(())
    }

    /// Pull, prefetch and hand over to the backlog until shutdown.
    async fn watch(&self, index: usize, backlog: mpsc::Sender<Prefetched>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut failures = FailureTracker::new(3);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.client.next_subtask().await {
                Ok(DispatchResponse::Subtask { subtask }) => {
                    failures.record_success();
                    metrics::record_poll("subtask");
                    if let Some(prefetched) = self.prefetch(*subtask, &shutdown).await {
                        let permit = tokio::select! {
                            _ = stopped(&mut shutdown) => None,
                            permit = backlog.reserve() => permit.ok(),
                        };
                        match permit {
                            Some(permit) => permit.send(prefetched),
                            None => {
                                self.abandon(prefetched).await;
                                break;
                            }
                        }
                    }
                    None
                }
                Ok(DispatchResponse::Skip) => {
                    failures.record_success();
                    metrics::record_poll("skip");
                    None
                }
                Ok(DispatchResponse::NoTasks) => {
                    failures.record_success();
                    metrics::record_poll("no_tasks");
                    Some(NO_TASKS_BACKOFF)
                }
                Err(e @ WorkerError::Unavailable(_)) => {
                    metrics::record_poll("unavailable");
                    if failures.record_failure() {
                        warn!(watcher = index, error = %e, "Composer unavailable");
                    }
                    Some(UNAVAILABLE_BACKOFF)
                }
                Err(e) => {
                    metrics::record_poll("error");
                    if failures.record_failure() {
                        error!(watcher = index, error = %e, "Failed to get subtask");
                    }
                    Some(ERROR_BACKOFF)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = stopped(&mut shutdown) => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        debug!(watcher = index, "Watcher stopped");
    }

    /// Download the subtask source. A failed download is reported here.
    async fn prefetch(&self, subtask: Subtask, shutdown: &watch::Receiver<bool>) -> Option<Prefetched> {
        let dir = self
            .config
            .work_dir
            .join(subtask.task_id.to_string())
            .join(subtask.part.to_string());
        let input = dir.join(format!("source.{}", source_extension(&subtask.source)));

        let result = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => self.client.download(&subtask.source, &input, shutdown).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(bytes) => {
                debug!(task_id = %subtask.task_id, part = subtask.part, bytes, "Source prefetched");
                Some(Prefetched { subtask, dir, input })
            }
            Err(e) => {
                let outcome = match e {
                    WorkerError::TaskGone => {
                        info!(task_id = %subtask.task_id, part = subtask.part, "Task gone before download");
                        RunOutcome::Gone
                    }
                    e if e.is_cancelled() => {
                        self.report(&subtask, Some(TaskError::task_reset(&self.config.hostname))).await;
                        RunOutcome::Reset
                    }
                    e => {
                        warn!(task_id = %subtask.task_id, part = subtask.part, error = %e, "Prefetch failed");
                        let error = WorkerError::download_failed(e.to_string()).to_task_error();
                        self.report(&subtask, Some(error)).await;
                        RunOutcome::Failed
                    }
                };
                metrics::record_subtask(subtask.payload.kind(), outcome.as_str(), 0.0);
                remove_part_dir(&dir).await;
                None
            }
        }
    }

    /// Give a prefetched subtask back as a worker reset.
    async fn abandon(&self, prefetched: Prefetched) {
        let Prefetched { subtask, dir, .. } = prefetched;
        info!(task_id = %subtask.task_id, part = subtask.part, "Abandoning queued subtask");
        self.report(&subtask, Some(TaskError::task_reset(&self.config.hostname))).await;
        metrics::record_subtask(subtask.payload.kind(), RunOutcome::Reset.as_str(), 0.0);
        remove_part_dir(&dir).await;
    }

    async fn run_job(&self, prefetched: Prefetched, admission: Admission, abort: watch::Receiver<bool>) {
        let logger = SubtaskLogger::new(&prefetched.subtask);
        let span = logger.create_span();

        async move {
            let started = Instant::now();
            let Prefetched { subtask, dir, input } = prefetched;
            logger.log_start(admission.slot(), admission.weight());

            let result = self.encode_and_upload(&subtask, &dir, input, abort).await;

            let outcome = match result {
                Ok(()) => {
                    self.report(&subtask, None).await;
                    logger.log_completion(started.elapsed().as_secs_f64());
                    RunOutcome::Success
                }
                Err(WorkerError::TaskGone) => {
                    logger.log_warning("task gone, dropping output");
                    RunOutcome::Gone
                }
                Err(e) if e.is_cancelled() => {
                    logger.log_warning("cancelled by shutdown");
                    self.report(&subtask, Some(TaskError::task_reset(&self.config.hostname)))
                        .await;
                    RunOutcome::Reset
                }
                Err(e) => {
                    logger.log_error(&e.to_string());
                    self.report(&subtask, Some(e.to_task_error())).await;
                    RunOutcome::Failed
                }
            };

            metrics::record_subtask(subtask.payload.kind(), outcome.as_str(), started.elapsed().as_secs_f64());
            remove_part_dir(&dir).await;
            drop(admission);
        }
        .instrument(span)
        .await
    }

    async fn encode_and_upload(
        &self,
        subtask: &Subtask,
        dir: &Path,
        input: PathBuf,
        abort: watch::Receiver<bool>,
    ) -> WorkerResult<()> {
        let request = TranscodeRequest {
            input,
            output_dir: dir.join(OUTPUT_DIR),
            output_name: subtask.output_name(),
            payload: subtask.payload.clone(),
            threads: 1,
        };

        // Encoding progress counts video time only; audio tracks span the
        // whole source and would overshoot it.
        let reporter = match &subtask.payload {
            SubtaskPayload::Video(_) => Some(ProgressReporter::spawn(
                self.client.clone(),
                subtask,
                self.config.progress_interval,
            )),
            SubtaskPayload::Audio(_) => None,
        };
        let sink = reporter.as_ref().map_or_else(progress::discard, ProgressReporter::sink);
        let executed = self.transcoder.execute(&request, abort, sink).await;
        if let Some(reporter) = reporter {
            if executed.is_ok() {
                reporter.flush((subtask.payload.duration() * 1000.0) as i64);
            }
            reporter.finish().await;
        }
        let output = executed?;

        self.client
            .upload(&subtask.push_to, subtask.part, &request.output_name, &output.output)
            .await
            .map_err(upload_error)?;

        if let Some(poster) = &output.poster {
            let name = poster
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "poster.jpg".to_string());
            self.client
                .upload(&subtask.push_to, subtask.part, &name, poster)
                .await
                .map_err(upload_error)?;
        }
        Ok(())
    }

    /// Send the completion report for `subtask`.
    async fn report(&self, subtask: &Subtask, error: Option<TaskError>) {
        let report = match error {
            Some(error) => CompletionReport::failure(subtask, error),
            None => CompletionReport::success(subtask),
        };
        match self.client.report_completion(&report).await {
            Ok(outcome) => debug!(task_id = %subtask.task_id, part = subtask.part, ?outcome, "Completion reported"),
            Err(e) => error!(
                task_id = %subtask.task_id,
                part = subtask.part,
                error = %e,
                "Failed to report completion"
            ),
        }
    }
}

fn upload_error(e: WorkerError) -> WorkerError {
    match e {
        WorkerError::TaskGone => WorkerError::TaskGone,
        other => WorkerError::upload_failed(other.to_string()),
    }
}

/// Removes the part directory, then the task directory once it is empty.
async fn remove_part_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove part directory");
        }
    }
    if let Some(task_dir) = dir.parent() {
        // Fails while other parts of the same task are still here.
        let _ = tokio::fs::remove_dir(task_dir).await;
    }
}

/// Forwards throttled encoding deltas to the composer from a background task.
struct ProgressReporter {
    throttle: Arc<Mutex<DeltaThrottle>>,
    tx: mpsc::UnboundedSender<i64>,
    forwarder: tokio::task::JoinHandle<()>,
}

impl ProgressReporter {
    fn spawn(client: ComposerClient, subtask: &Subtask, interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<i64>();
        let task_id = subtask.task_id;

        let forwarder = tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                if let Err(e) = client.report_progress(task_id, delta).await {
                    debug!(%task_id, delta, error = %e, "Progress report dropped");
                }
            }
        });

        Self {
            throttle: Arc::new(Mutex::new(DeltaThrottle::new(interval))),
            tx,
            forwarder,
        }
    }

    fn sink(&self) -> ProgressSink {
        let throttle = Arc::clone(&self.throttle);
        let tx = self.tx.clone();
        Box::new(move |progress: FfmpegProgress| {
            let delta = match throttle.lock() {
                Ok(mut t) => t.observe(&progress, Instant::now()),
                Err(_) => None,
            };
            if let Some(delta) = delta {
                let _ = tx.send(delta);
            }
        })
    }

    /// Report whatever is left of `total_ms`.
    fn flush(&self, total_ms: i64) {
        let delta = match self.throttle.lock() {
            Ok(mut t) => t.flush(total_ms),
            Err(_) => None,
        };
        if let Some(delta) = delta {
            let _ = self.tx.send(delta);
        }
    }

    /// Wait until queued reports are sent.
    async fn finish(self) {
        let Self { tx, forwarder, .. } = self;
        drop(tx);
        if let Err(e) = forwarder.await {
            warn!(error = %e, "Progress forwarder ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_extension() {
        assert_eq!(source_extension("http://c/v1/chunks?task_id=x&path=chunks/chunk_001.mp4"), "mp4");
        assert_eq!(source_extension("http://c/v1/chunks?task_id=x&path=audios/source_00.mka"), "mka");
        assert_eq!(source_extension("http://c/v1/chunks?task_id=x"), "mp4");
        assert_eq!(source_extension("http://c/v1/file.tar.gz?x=a/b"), "mp4");
    }

    #[tokio::test]
    async fn test_remove_part_dir_keeps_busy_task_dir() {
        let root = tempfile::tempdir().unwrap();
        let task = root.path().join("t1");
        tokio::fs::create_dir_all(task.join("0")).await.unwrap();
        tokio::fs::create_dir_all(task.join("1")).await.unwrap();

        remove_part_dir(&task.join("0")).await;
        assert!(task.exists());

        remove_part_dir(&task.join("1")).await;
        assert!(!task.exists());
    }
}
