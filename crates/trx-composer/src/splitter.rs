//! Split phase: fetch the source, cut it into chunks and enqueue subtasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use trx_media::{probe, segment, MediaError};
use trx_models::{progress, ErrorCode, ErrorDomain, Task};
use trx_queue::DispatchQueue;
use trx_store::ClaimRequest;

use crate::cancellation::CancelWatch;
use crate::config::ComposerConfig;
use crate::error::{ComposerError, ComposerResult};
use crate::lifecycle::Lifecycle;
use crate::metrics;
use crate::phase::{stopped, Phase};
use crate::planner::{plan_subtasks, PlannedAudio, PlannedChunk};
use crate::validate::{pre_validate, ChunkCheck};
use crate::workdir::{self, AUDIOS_DIR, CHUNKS_DIR, SOURCE_DIR};

pub struct Splitter {
    config: Arc<ComposerConfig>,
    lifecycle: Lifecycle,
    dispatch: DispatchQueue,
    http: reqwest::Client,
}

impl Splitter {
    pub fn new(
        config: Arc<ComposerConfig>,
        lifecycle: Lifecycle,
        dispatch: DispatchQueue,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            lifecycle,
            dispatch,
            http,
        }
    }

    async fn split(&self, task: &Task, dir: &Path, cancel: watch::Receiver<bool>) -> ComposerResult<usize> {
        let meta = self.lifecycle.meta();

        let source = self.fetch_source(task, &dir.join(SOURCE_DIR), &cancel).await?;
        meta.advance_progress(&task.id, progress::AFTER_DOWNLOAD).await?;

        let info = probe(&source)
            .await
            .map_err(|e| ComposerError::media_step(e, ErrorCode::SplitSourcesError, ErrorDomain::Splitter))?;
        let Some(video) = info.video.as_ref() else {
            return Err(ComposerError::validation(ErrorDomain::Splitter, "source has no video stream"));
        };

        let chunks = segment::split_video(&source, &dir.join(CHUNKS_DIR), self.config.chunk_seconds, &cancel)
            .await
            .map_err(|e| ComposerError::media_step(e, ErrorCode::SplitSourcesError, ErrorDomain::Splitter))?;

        let mut checks = Vec::with_capacity(chunks.len());
        let mut planned = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let path = chunk.path.to_string_lossy();
            let duration = probe(&path)
                .await
                .map_err(|e| ComposerError::media_step(e, ErrorCode::SplitSourcesError, ErrorDomain::Splitter))?
                .duration;
            checks.push(ChunkCheck {
                name: chunk.file_name(),
                size: chunk.size,
                duration,
            });
            planned.push(PlannedChunk {
                rel_path: format!("{CHUNKS_DIR}/{}", chunk.file_name()),
                duration,
            });
        }
        pre_validate(&checks, info.duration)?;

        let mut audios = Vec::with_capacity(info.audio.len());
        for (track, stream) in info.audio.iter().enumerate() {
            let name = format!("source_{track:02}.mka");
            segment::extract_audio(&source, stream.index, &dir.join(AUDIOS_DIR).join(&name), &cancel)
                .await
                .map_err(|e| ComposerError::media_step(e, ErrorCode::UnmuxAudioError, ErrorDomain::Splitter))?;
            audios.push(PlannedAudio {
                track: track as u32,
                rel_path: format!("{AUDIOS_DIR}/{name}"),
                duration: info.duration,
            });
        }

        if *cancel.borrow() {
            return Err(ComposerError::Canceled);
        }

        let subtasks = plan_subtasks(
            task,
            &video.codec,
            &planned,
            &audios,
            &self.config.encode,
            &self.config.public_url(),
        );
        let parts_total = subtasks.len() as u32;

        meta.reset_for_split(&task.id).await?;
        meta.advance_progress(&task.id, progress::AFTER_SPLIT).await?;

        // The status guard fails if the task was canceled meanwhile; nothing
        // is enqueued in that case.
        if !self.lifecycle.store().start_encoding(task.id, parts_total).await? {
            return Err(ComposerError::Canceled);
        }
        self.dispatch.enqueue(&task.routing, &subtasks).await?;
        metrics::record_enqueued(&task.routing, subtasks.len());

        Ok(subtasks.len())
    }

    /// Local path or URL FFmpeg reads the source from. Remote sources are
    /// downloaded first.
    async fn fetch_source(&self, task: &Task, dir: &Path, cancel: &watch::Receiver<bool>) -> ComposerResult<String> {
        if let Some(path) = &task.source.path {
            if !Path::new(path).is_file() {
                return Err(ComposerError::Media(MediaError::FileNotFound(PathBuf::from(path))));
            }
            return Ok(path.clone());
        }

        let url = task
            .source
            .url
            .as_deref()
            .ok_or_else(|| ComposerError::validation(ErrorDomain::Splitter, "task has no source"))?;

        tokio::fs::create_dir_all(dir).await?;
        let ext = Path::new(url.split('?').next().unwrap_or_default())
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| e.len() <= 5)
            .unwrap_or("mp4");
        let dst = dir.join(format!("source.{ext}"));

        debug!(task_id = %task.id, url, "Downloading source");
        let response = self.http.get(url).send().await?.error_for_status()?;
        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(&dst).await?;
        let mut cancel = cancel.clone();

        loop {
            let next = tokio::select! {
                _ = stopped(&mut cancel) => return Err(ComposerError::Canceled),
                next = stream.next() => next,
            };
            match next {
                Some(bytes) => file.write_all(&bytes?).await?,
                None => break,
            }
        }
        file.flush().await?;

        Ok(dst.to_string_lossy().to_string())
    }
}

#[async_trait]
impl Phase for Splitter {
    fn name(&self) -> &'static str {
        "split"
    }

    fn claim_request(&self) -> ClaimRequest {
        ClaimRequest::split(self.config.hostname.clone())
    }

    async fn process(&self, task: Task) {
        let started = Instant::now();
        let dir = self.config.task_dir(&task.id);
        let watch = CancelWatch::spawn(
            Arc::clone(self.lifecycle.store()),
            self.lifecycle.meta().clone(),
            task.id,
            self.config.cancel_poll,
        );

        let result = self.split(&task, &dir, watch.receiver()).await;
        let canceled = watch.is_canceled();
        drop(watch);

        match result {
            Ok(parts) if !canceled => {
                workdir::remove_dir(&task.id, &dir.join(SOURCE_DIR)).await;
                metrics::record_phase_duration("split", started.elapsed().as_secs_f64());
                info!(task_id = %task.id, parts, routing = %task.routing, "Task split");
            }
            Err(e) if !canceled && !e.is_canceled() => {
                let error = e.to_task_error(ErrorDomain::Splitter);
                if let Err(e) = self.lifecycle.fail(task.id, &error).await {
                    warn!(task_id = %task.id, error = %e, "Failed to record split failure");
                }
                workdir::remove_dir(&task.id, &dir).await;
            }
            _ => {
                info!(task_id = %task.id, "Split abandoned, task canceled");
                if let Err(e) = self.lifecycle.meta().set_skip(&task.id).await {
                    warn!(task_id = %task.id, error = %e, "Failed to set skip flag");
                }
                workdir::remove_dir(&task.id, &dir).await;
            }
        }
    }
}
