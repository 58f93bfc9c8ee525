//! Work dir hygiene: reset leftovers at startup, sweep stale entries later.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{debug, info, warn};
use trx_models::{CompletionReport, TaskError, TaskId};

use crate::client::ComposerClient;
use crate::error::WorkerResult;
use crate::{metrics, stopped};

/// Fail every task that still has a directory from a previous run.
///
/// Those subtasks were interrupted and will never be reported otherwise.
/// Returns the ids that were reset.
pub async fn reset_tasks(work_dir: &Path, client: &ComposerClient) -> WorkerResult<Vec<TaskId>> {
    let hostname = client.identity().hostname.clone();
    let mut reset = Vec::new();
    let mut entries = tokio::fs::read_dir(work_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let Ok(task_id) = entry.file_name().to_string_lossy().parse::<TaskId>() else {
            continue;
        };
        if !entry.file_type().await?.is_dir() {
            continue;
        }

        tokio::fs::remove_dir_all(entry.path()).await?;
        let report = CompletionReport {
            task_id,
            part: 0,
            parts_total: 1,
            error: Some(TaskError::task_reset(&hostname)),
        };
        match client.report_completion(&report).await {
            Ok(outcome) => info!(%task_id, ?outcome, "Reset interrupted task"),
            Err(e) => warn!(%task_id, error = %e, "Failed to report task reset"),
        }
        reset.push(task_id);
    }

    metrics::record_workdir_removed("reset", reset.len());
    Ok(reset)
}

/// Remove work dir entries last modified more than `max_age` ago.
pub async fn sweep(work_dir: &Path, max_age: Duration) -> WorkerResult<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(work_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let path = entry.path();
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {
                debug!(path = %path.display(), age_secs = age.as_secs(), "Removed stale entry");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale entry"),
        }
    }

    metrics::record_workdir_removed("stale", removed);
    Ok(removed)
}

/// Run [`sweep`] every `interval` until `shutdown` flips.
pub async fn run_janitor(work_dir: &Path, interval: Duration, max_age: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = sweep(work_dir, max_age).await {
            warn!(error = %e, "Work dir sweep failed");
        }
    }
}
