//! Subtask execution: encode one chunk or one audio track.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};
use trx_models::{AudioJob, SubtaskPayload, VideoJob};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::MediaResult;
use crate::progress::ProgressSink;
use crate::segment;

/// What to run.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    /// Local copy of the subtask source
    pub input: PathBuf,
    /// Directory the outputs are written to
    pub output_dir: PathBuf,
    /// File name of the encoded output
    pub output_name: String,
    pub payload: SubtaskPayload,
    /// Encoder threads; one per admitted slot
    pub threads: u32,
}

/// What was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    pub output: PathBuf,
    pub poster: Option<PathBuf>,
}

/// Runs a subtask to completion, honoring `cancel` and reporting progress.
#[async_trait]
pub trait TranscodeExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &TranscodeRequest,
        cancel: watch::Receiver<bool>,
        progress: ProgressSink,
    ) -> MediaResult<ExecutionOutput>;
}

/// Executor backed by the `ffmpeg` binary.
#[derive(Debug, Default, Clone)]
pub struct FfmpegExecutor {
    /// Kill a single encode after this many seconds
    pub timeout_secs: Option<u64>,
}

impl FfmpegExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn runner(&self, cancel: watch::Receiver<bool>) -> FfmpegRunner {
        let runner = FfmpegRunner::new().with_cancel(cancel);
        match self.timeout_secs {
            Some(secs) => runner.with_timeout(secs),
            None => runner,
        }
    }
}

/// FFmpeg arguments for a video encode.
pub fn video_command(request: &TranscodeRequest, job: &VideoJob) -> FfmpegCommand {
    let cmd = FfmpegCommand::new(&request.input, request.output_dir.join(&request.output_name))
        .video_codec(&job.codec)
        .preset(job.preset.as_str())
        .output_args(["-pix_fmt", "yuv420p"])
        .no_audio()
        .threads(request.threads)
        .faststart();

    match job.bitrate_kbps {
        Some(kbps) => cmd.video_bitrate(kbps),
        None => cmd.crf(job.crf),
    }
}

/// FFmpeg arguments for an audio encode.
pub fn audio_command(request: &TranscodeRequest, job: &AudioJob) -> FfmpegCommand {
    FfmpegCommand::new(&request.input, request.output_dir.join(&request.output_name))
        .no_video()
        .audio_codec(&job.codec)
        .audio_bitrate(job.bitrate_kbps)
        .threads(request.threads)
}

#[async_trait]
impl TranscodeExecutor for FfmpegExecutor {
    async fn execute(
        &self,
        request: &TranscodeRequest,
        cancel: watch::Receiver<bool>,
        progress: ProgressSink,
    ) -> MediaResult<ExecutionOutput> {
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let cmd = match &request.payload {
            SubtaskPayload::Video(job) => video_command(request, job),
            SubtaskPayload::Audio(job) => audio_command(request, job),
        };
        self.runner(cancel.clone())
            .run_with_progress(&cmd, progress)
            .await?;

        let poster = match &request.payload {
            SubtaskPayload::Video(job) if job.create_poster => {
                let dst = request.output_dir.join("poster.jpg");
                match segment::poster(&request.input, &dst, request.threads, &cancel).await {
                    Ok(path) => Some(path),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!(input = %request.input.display(), error = %e, "Poster generation failed");
                        None
                    }
                }
            }
            _ => None,
        };

        let output = cmd.output().to_path_buf();
        info!(output = %output.display(), kind = request.payload.kind(), "Encode finished");
        Ok(ExecutionOutput { output, poster })
    }
}
