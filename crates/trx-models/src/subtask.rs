//! Subtasks: the unit of work placed on the dispatch queue.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::TaskId;

/// Encoder speed/quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    #[default]
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Ultrafast => "ultrafast",
            Preset::Superfast => "superfast",
            Preset::Veryfast => "veryfast",
            Preset::Faster => "faster",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
            Preset::Slower => "slower",
            Preset::Veryslow => "veryslow",
        }
    }
}

/// Encode one video chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VideoJob {
    /// Codec of the chunk as produced by the splitter (e.g. "h264")
    pub source_codec: String,
    /// Target codec, e.g. "libx264"
    pub codec: String,
    pub preset: Preset,
    /// Target bitrate in kbit/s; `None` selects CRF mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<u32>,
    #[serde(default = "default_crf")]
    pub crf: u8,
    /// Chunk duration in seconds
    pub duration: f64,
    /// Extract a poster frame from this chunk
    #[serde(default)]
    pub create_poster: bool,
}

fn default_crf() -> u8 {
    23
}

/// Encode one audio track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AudioJob {
    pub track: u32,
    pub codec: String,
    pub bitrate_kbps: u32,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubtaskPayload {
    Video(VideoJob),
    Audio(AudioJob),
}

impl SubtaskPayload {
    pub fn duration(&self) -> f64 {
        match self {
            SubtaskPayload::Video(v) => v.duration,
            SubtaskPayload::Audio(a) => a.duration,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SubtaskPayload::Video(_) => "video",
            SubtaskPayload::Audio(_) => "audio",
        }
    }
}

/// One part of a task, serialized as JSON onto a dispatch shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Subtask {
    pub task_id: TaskId,
    /// Zero-based part index
    pub part: u32,
    pub parts_total: u32,
    pub payload: SubtaskPayload,
    /// URL the worker downloads the chunk from
    pub source: String,
    /// Base URL the worker uploads encoded output to
    pub push_to: String,
    pub created_at: DateTime<Utc>,
}

impl Subtask {
    pub fn new(
        task_id: TaskId,
        part: u32,
        parts_total: u32,
        payload: SubtaskPayload,
        source: impl Into<String>,
        push_to: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            part,
            parts_total,
            payload,
            source: source.into(),
            push_to: push_to.into(),
            created_at: Utc::now(),
        }
    }

    /// Codec of the input chunk, used by worker cost models.
    pub fn source_codec(&self) -> Option<&str> {
        match &self.payload {
            SubtaskPayload::Video(v) => Some(v.source_codec.as_str()),
            SubtaskPayload::Audio(_) => None,
        }
    }

    /// File name the encoded output is uploaded under.
    pub fn output_name(&self) -> String {
        match &self.payload {
            SubtaskPayload::Video(_) => format!("part_{:05}.mp4", self.part),
            SubtaskPayload::Audio(a) => format!("audio_{:02}.m4a", a.track),
        }
    }
}
