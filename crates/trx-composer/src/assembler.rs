//! Assemble phase: stitch encoded parts and finalize the assets.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use trx_media::{probe, segment};
use trx_models::{progress, ErrorCode, ErrorDomain, Task, TaskStatus};
use trx_store::ClaimRequest;

use crate::cancellation::CancelWatch;
use crate::config::ComposerConfig;
use crate::error::{ComposerError, ComposerResult};
use crate::lifecycle::Lifecycle;
use crate::metrics;
use crate::phase::Phase;
use crate::validate::post_validate;
use crate::workdir::{self, ASSETS_DIR, ENCODED_DIR};

const STITCHED_NAME: &str = "video_stitched.mp4";
const VIDEO_NAME: &str = "video.mp4";
const POSTER_NAME: &str = "poster.jpg";

/// Worker uploads found in a task's `encoded/` directory.
#[derive(Debug, Default, PartialEq)]
pub struct EncodedParts {
    /// `part_NNNNN.mp4`, ordered by part number
    pub videos: Vec<PathBuf>,
    /// `audio_NN.m4a`, ordered by track
    pub audios: Vec<PathBuf>,
    pub poster: Option<PathBuf>,
}

impl EncodedParts {
    pub async fn collect(dir: &Path) -> ComposerResult<Self> {
        let mut parts = Self::default();
        let mut entries = tokio::fs::read_dir(dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();
            if name.starts_with("part_") && name.ends_with(".mp4") {
                parts.videos.push(path);
            } else if name.starts_with("audio_") && name.ends_with(".m4a") {
                parts.audios.push(path);
            } else if name == POSTER_NAME {
                parts.poster = Some(path);
            }
        }

        // Zero-padded names sort in part order.
        parts.videos.sort();
        parts.audios.sort();
        Ok(parts)
    }
}

pub struct Assembler {
    config: Arc<ComposerConfig>,
    lifecycle: Lifecycle,
}

impl Assembler {
    pub fn new(config: Arc<ComposerConfig>, lifecycle: Lifecycle) -> Self {
        Self { config, lifecycle }
    }

    async fn assemble(&self, task: &Task, dir: &Path, cancel: watch::Receiver<bool>) -> ComposerResult<PathBuf> {
        let meta = self.lifecycle.meta();
        let parts = EncodedParts::collect(&dir.join(ENCODED_DIR)).await?;
        if let Some(expected) = task.parts_total {
            let found = parts.videos.len() + parts.audios.len();
            if found != expected as usize {
                return Err(ComposerError::validation(
                    ErrorDomain::Assembler,
                    format!("expected {expected} encoded parts, found {found}"),
                ));
            }
        }

        let assets = dir.join(ASSETS_DIR);
        let stitched = assets.join(STITCHED_NAME);
        segment::stitch(&parts.videos, &stitched, &cancel)
            .await
            .map_err(|e| ComposerError::media_step(e, ErrorCode::StitchSourcesError, ErrorDomain::Assembler))?;
        meta.advance_progress(&task.id, progress::AFTER_STITCH).await?;

        let info = probe(&stitched.to_string_lossy())
            .await
            .map_err(|e| ComposerError::media_step(e, ErrorCode::StitchSourcesError, ErrorDomain::Assembler))?;
        post_validate(info.duration, task.duration)?;

        let frag = self.config.fragment_seconds;
        segment::fragment(&stitched, &assets.join(VIDEO_NAME), frag, &cancel)
            .await
            .map_err(|e| ComposerError::media_step(e, ErrorCode::FragmentSourcesError, ErrorDomain::Assembler))?;
        tokio::fs::remove_file(&stitched).await?;
        meta.advance_progress(&task.id, progress::AFTER_VIDEO_FINALIZE).await?;

        for audio in &parts.audios {
            let Some(name) = audio.file_name() else { continue };
            segment::fragment(audio, &assets.join(name), frag, &cancel)
                .await
                .map_err(|e| ComposerError::media_step(e, ErrorCode::FragmentSourcesError, ErrorDomain::Assembler))?;
        }
        meta.advance_progress(&task.id, progress::AFTER_AUDIO_FINALIZE).await?;

        match &parts.poster {
            Some(poster) => {
                tokio::fs::copy(poster, assets.join(POSTER_NAME)).await?;
            }
            None => debug!(task_id = %task.id, "No poster uploaded"),
        }

        if *cancel.borrow() {
            return Err(ComposerError::Canceled);
        }
        publish(&assets, &self.config.output_dir.join(task.id.to_string())).await
    }
}

/// Move finished assets to their final location, copying when a rename
/// crosses filesystems.
async fn publish(assets: &Path, dst: &Path) -> ComposerResult<PathBuf> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Leftover of an earlier, interrupted publish.
    let _ = tokio::fs::remove_dir_all(dst).await;

    if tokio::fs::rename(assets, dst).await.is_ok() {
        return Ok(dst.to_path_buf());
    }

    tokio::fs::create_dir_all(dst).await?;
    let mut entries = tokio::fs::read_dir(assets).await?;
    while let Some(entry) = entries.next_entry().await? {
        tokio::fs::copy(entry.path(), dst.join(entry.file_name())).await?;
    }
    Ok(dst.to_path_buf())
}

#[async_trait]
impl Phase for Assembler {
    fn name(&self) -> &'static str {
        "assemble"
    }

    fn claim_request(&self) -> ClaimRequest {
        ClaimRequest::assemble(self.config.hostname.clone())
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

        let result = self.assemble(&task, &dir, watch.receiver()).await;
        let canceled = watch.is_canceled();
        drop(watch);

        match result {
            Ok(output) if !canceled => match self.finish(&task).await {
                Ok(()) => {
                    metrics::record_phase_duration("assemble", started.elapsed().as_secs_f64());
                    info!(task_id = %task.id, output = %output.display(), "Task done");
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to mark task done"),
            },
            Err(e) if !canceled && !e.is_canceled() => {
                let error = e.to_task_error(ErrorDomain::Assembler);
                if let Err(e) = self.lifecycle.fail(task.id, &error).await {
                    warn!(task_id = %task.id, error = %e, "Failed to record assemble failure");
                }
            }
            _ => info!(task_id = %task.id, "Assembly abandoned, task canceled"),
        }

        workdir::remove_dir(&task.id, &dir).await;
    }
}

impl Assembler {
    async fn finish(&self, task: &Task) -> ComposerResult<()> {
        if self.lifecycle.advance(task, TaskStatus::Done).await? {
            metrics::record_completed();
        }
        self.lifecycle.meta().advance_progress(&task.id, progress::DONE).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_orders_parts() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "part_00010.mp4",
            "part_00002.mp4",
            "audio_01.m4a",
            "audio_00.m4a",
            "poster.jpg",
            "stray.txt",
        ] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        let parts = EncodedParts::collect(dir.path()).await.unwrap();
        let names = |paths: &[PathBuf]| -> Vec<String> {
            paths
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
                .collect()
        };
        assert_eq!(names(&parts.videos), vec!["part_00002.mp4", "part_00010.mp4"]);
        assert_eq!(names(&parts.audios), vec!["audio_00.m4a", "audio_01.m4a"]);
        assert_eq!(parts.poster, Some(dir.path().join("poster.jpg")));
    }

    #[tokio::test]
    async fn test_publish_moves_assets() {
        let root = tempfile::tempdir().unwrap();
        let assets = root.path().join("work/t1/assets");
        tokio::fs::create_dir_all(&assets).await.unwrap();
        tokio::fs::write(assets.join("video.mp4"), b"v").await.unwrap();

        let dst = root.path().join("out/t1");
        let published = publish(&assets, &dst).await.unwrap();
        assert_eq!(published, dst);
        assert!(dst.join("video.mp4").is_file());
        assert!(!assets.exists());
    }
}
