//! Turning a split task into subtasks.

use trx_models::{AudioJob, Subtask, SubtaskPayload, Task, VideoJob};

use crate::config::EncodeProfile;

/// A video chunk ready for dispatch, path relative to the task directory.
#[derive(Debug, Clone)]
pub struct PlannedChunk {
    pub rel_path: String,
    pub duration: f64,
}

/// An unmuxed audio track ready for dispatch.
#[derive(Debug, Clone)]
pub struct PlannedAudio {
    pub track: u32,
    pub rel_path: String,
    pub duration: f64,
}

/// Subtasks of one task: video chunks first (part `i` for chunk `i`,
/// the first one also extracts the poster), then one part per audio track.
pub fn plan_subtasks(
    task: &Task,
    source_codec: &str,
    chunks: &[PlannedChunk],
    audios: &[PlannedAudio],
    profile: &EncodeProfile,
    base_url: &str,
) -> Vec<Subtask> {
    let parts_total = (chunks.len() + audios.len()) as u32;
    let push_to = format!("{base_url}/v1/tasks/{}/parts", task.id);
    let source_url = |rel: &str| format!("{base_url}/v1/chunks?task_id={}&path={rel}", task.id);

    let video = chunks.iter().enumerate().map(|(i, chunk)| {
        let payload = SubtaskPayload::Video(VideoJob {
            source_codec: source_codec.to_string(),
            codec: profile.video_codec.clone(),
            preset: profile.preset,
            bitrate_kbps: profile.video_bitrate_kbps,
            crf: profile.crf,
            duration: chunk.duration,
            create_poster: i == 0,
        });
        Subtask::new(task.id, i as u32, parts_total, payload, source_url(&chunk.rel_path), &push_to)
    });

    let audio = audios.iter().enumerate().map(|(i, audio)| {
        let payload = SubtaskPayload::Audio(AudioJob {
            track: audio.track,
            codec: profile.audio_codec.clone(),
            bitrate_kbps: profile.audio_bitrate_kbps,
            duration: audio.duration,
        });
        let part = (chunks.len() + i) as u32;
        Subtask::new(task.id, part, parts_total, payload, source_url(&audio.rel_path), &push_to)
    });

    video.chain(audio).collect()
}
