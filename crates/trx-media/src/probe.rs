//! FFprobe media information.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::command::check_ffprobe;
use crate::error::{MediaError, MediaResult};

/// One elementary stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Absolute stream index in the container
    pub index: u32,
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
}

/// Container-level information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Duration in seconds
    pub duration: f64,
    /// File size in bytes
    pub size: u64,
    pub format_name: String,
    pub video: Option<StreamInfo>,
    pub audio: Vec<StreamInfo>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: String,
    codec_name: Option<String>,
    channels: Option<u32>,
}

/// Probe a local file or URL.
pub async fn probe(input: &str) -> MediaResult<MediaInfo> {
    let is_remote = input.starts_with("http://") || input.starts_with("https://");
    if !is_remote && !Path::new(input).exists() {
        return Err(MediaError::FileNotFound(input.into()));
    }
    check_ffprobe()?;

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(input)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(MediaError::FfprobeFailed {
            message: format!("ffprobe failed on {input}"),
            stderr: Some(String::from_utf8_lossy(&output.stderr).to_string()),
        });
    }

    parse_probe_output(&output.stdout)
}

/// Get media duration in seconds.
pub async fn get_duration(input: &str) -> MediaResult<f64> {
    Ok(probe(input).await?.duration)
}

fn parse_probe_output(stdout: &[u8]) -> MediaResult<MediaInfo> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;

    let stream = |s: &FfprobeStream| StreamInfo {
        index: s.index,
        codec: s.codec_name.clone().unwrap_or_default(),
        channels: s.channels,
    };

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .map(stream);
    let audio = probe
        .streams
        .iter()
        .filter(|s| s.codec_type == "audio")
        .map(stream)
        .collect();

    Ok(MediaInfo {
        duration: probe
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0),
        size: probe
            .format
            .size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        format_name: probe.format.format_name.unwrap_or_default(),
        video,
        audio,
    })
}
