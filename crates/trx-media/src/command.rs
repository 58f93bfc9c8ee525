//! FFmpeg command builder and runner.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::classify::classify_stderr;
use crate::error::{MediaError, MediaResult};
use crate::progress::{parse_progress_line, FfmpegProgress};

/// Stderr lines kept for failure classification.
const STDERR_TAIL: usize = 64;

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    /// Arguments before -i
    input_args: Vec<String>,
    /// Arguments after -i
    output_args: Vec<String>,
    overwrite: bool,
    log_level: String,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    pub fn input_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Limit how much input is read.
    pub fn duration(self, seconds: f64) -> Self {
        self.input_arg("-t").input_arg(format!("{:.3}", seconds))
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    /// Stream copy, no re-encode.
    pub fn copy(self) -> Self {
        self.output_arg("-c").output_arg("copy")
    }

    pub fn crf(self, crf: u8) -> Self {
        self.output_arg("-crf").output_arg(crf.to_string())
    }

    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    /// Constrained bitrate: target, max and a two-second buffer.
    pub fn video_bitrate(self, kbps: u32) -> Self {
        self.output_args([
            "-b:v".to_string(),
            format!("{kbps}k"),
            "-maxrate".to_string(),
            format!("{kbps}k"),
            "-bufsize".to_string(),
            format!("{}k", kbps.saturating_mul(2)),
        ])
    }

    pub fn audio_bitrate(self, kbps: u32) -> Self {
        self.output_arg("-b:a").output_arg(format!("{kbps}k"))
    }

    pub fn no_audio(self) -> Self {
        self.output_arg("-an")
    }

    pub fn no_video(self) -> Self {
        self.output_arg("-vn")
    }

    pub fn threads(self, threads: u32) -> Self {
        self.output_arg("-threads").output_arg(threads.max(1).to_string())
    }

    pub fn faststart(self) -> Self {
        self.output_arg("-movflags").output_arg("+faststart")
    }

    pub fn single_frame(self) -> Self {
        self.output_arg("-frames:v").output_arg("1")
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }
        args.push("-hide_banner".to_string());
        args.push("-xerror".to_string());
        args.push("-v".to_string());
        args.push(self.log_level.clone());

        // Progress blocks go to stderr alongside error lines.
        args.push("-progress".to_string());
        args.push("pipe:2".to_string());

        args.extend(self.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());

        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());

        args
    }
}

/// Runner for FFmpeg commands with progress tracking and cancellation.
#[derive(Default)]
pub struct FfmpegRunner {
    cancel_rx: Option<watch::Receiver<bool>>,
    timeout_secs: Option<u64>,
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the child when the flag flips to `true`.
    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
        self.run_with_progress(cmd, |_| {}).await
    }

    /// Run an FFmpeg command, feeding each progress block to `on_progress`.
    pub async fn run_with_progress<F>(&self, cmd: &FfmpegCommand, on_progress: F) -> MediaResult<()>
    where
        F: Fn(FfmpegProgress) + Send + 'static,
    {
        check_ffmpeg()?;
        if self.is_cancelled() {
            return Err(MediaError::Cancelled);
        }

        let args = cmd.build_args();
        debug!("Running FFmpeg: ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::internal("ffmpeg stderr not captured"))?;
        let mut reader = BufReader::new(stderr).lines();

        let stderr_handle = tokio::spawn(async move {
            let mut current = FfmpegProgress::default();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL);

            while let Ok(Some(line)) = reader.next_line().await {
                if let Some(progress) = parse_progress_line(&line, &mut current) {
                    on_progress(progress);
                } else if !is_progress_field(&line) {
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let result = self.wait_for_completion(&mut child).await;
        let stderr = stderr_handle.await.unwrap_or_default();

        match result {
            Ok(Some(code)) => {
                let classified = classify_stderr(&stderr);
                Err(MediaError::ffmpeg_failed(
                    classified.code,
                    classified.message,
                    Some(stderr),
                    Some(code),
                ))
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Wait for the child; `Ok(Some(code))` on a non-zero exit.
    async fn wait_for_completion(&self, child: &mut Child) -> MediaResult<Option<i32>> {
        let timeout = self
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(Duration::MAX);

        let waited = tokio::select! {
            res = tokio::time::timeout(timeout, child.wait()) => match res {
                Ok(status) => Waited::Exited(status),
                Err(_) => Waited::TimedOut,
            },
            _ = cancelled(self.cancel_rx.clone()) => Waited::Cancelled,
        };

        let status = match waited {
            Waited::Exited(status) => status?,
            Waited::TimedOut => {
                let secs = self.timeout_secs.unwrap_or_default();
                warn!("FFmpeg timed out after {} seconds, killing process", secs);
                let _ = child.kill().await;
                return Err(MediaError::Timeout(secs));
            }
            Waited::Cancelled => {
                info!("FFmpeg cancelled, killing process");
                let _ = child.kill().await;
                return Err(MediaError::Cancelled);
            }
        };

        if status.success() {
            Ok(None)
        } else {
            Ok(Some(status.code().unwrap_or(-1)))
        }
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Resolves once the flag is set; never resolves without a receiver or
/// after the sender is gone.
async fn cancelled(rx: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = rx {
        let closed = rx.wait_for(|c| *c).await.is_err();
        if !closed {
            return;
        }
    }
    std::future::pending::<()>().await
}

fn is_progress_field(line: &str) -> bool {
    line.split_once('=')
        .is_some_and(|(key, _)| !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

/// Check if FFprobe is available.
pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let cmd = FfmpegCommand::new("input.mp4", "output.mp4")
            .duration(30.0)
            .video_codec("libx264")
            .preset("fast")
            .crf(18)
            .threads(1);

        let args = cmd.build_args();
        let i = args.iter().position(|a| a == "-i").unwrap();
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert!(t < i, "input options precede -i");
        assert!(args.contains(&"30.000".to_string()));
        assert!(args.contains(&"libx264".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("output.mp4"));
        assert!(args.windows(2).any(|w| w == ["-progress", "pipe:2"]));
    }

    #[test]
    fn test_bitrate_sets_buffer() {
        let args = FfmpegCommand::new("a", "b").video_bitrate(3000).build_args();
        assert!(args.windows(2).any(|w| w == ["-maxrate", "3000k"]));
        assert!(args.windows(2).any(|w| w == ["-bufsize", "6000k"]));
    }

    #[test]
    fn test_progress_fields_are_not_stderr() {
        assert!(is_progress_field("out_time_us=1000"));
        assert!(is_progress_field("progress=continue"));
        assert!(!is_progress_field("[h264 @ 0x55] Invalid NAL unit size"));
        assert!(!is_progress_field("Error while decoding stream #0:0"));
    }

    #[tokio::test]
    async fn test_cancel_flag_set_before_start() {
        let (tx, rx) = watch::channel(true);
        let runner = FfmpegRunner::new().with_cancel(rx);
        let cmd = FfmpegCommand::new("in.mp4", "out.mp4");

        // Either ffmpeg is missing or the cancel check fires first.
        let err = runner.run(&cmd).await.unwrap_err();
        assert!(matches!(err, MediaError::Cancelled | MediaError::FfmpegNotFound));
        drop(tx);
    }
}
