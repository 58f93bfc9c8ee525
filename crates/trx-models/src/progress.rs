//! Progress checkpoints for a task, expressed as percentages.

/// Source downloaded to the coordinator.
pub const AFTER_DOWNLOAD: i64 = 5;
/// Split finished; subtasks about to be enqueued.
pub const AFTER_SPLIT: i64 = 10;
/// Every subtask reported completion.
pub const AFTER_ENCODING: i64 = 80;
/// Encoded parts stitched per quality.
pub const AFTER_STITCH: i64 = 90;
/// Video output fragmented and finalized.
pub const AFTER_VIDEO_FINALIZE: i64 = 95;
/// Audio tracks finalized.
pub const AFTER_AUDIO_FINALIZE: i64 = 98;
pub const DONE: i64 = 100;

/// Map accumulated encoded media time onto the encoding sub-range.
///
/// `encoded_ms` is clamped to `duration_ms`; the result lies in
/// `AFTER_SPLIT..=AFTER_ENCODING`.
pub fn encoding_percent(encoded_ms: i64, duration_ms: i64) -> i64 {
    if duration_ms <= 0 {
        return AFTER_SPLIT;
    }
    let done = encoded_ms.clamp(0, duration_ms);
    let span = AFTER_ENCODING - AFTER_SPLIT;
    AFTER_SPLIT + done * span / duration_ms
}
