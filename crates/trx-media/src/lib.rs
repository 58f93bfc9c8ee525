//! FFmpeg CLI wrapper for the transcoding pipeline.
//!
//! This crate provides:
//! - A command builder and a cancellable runner with `-progress` parsing
//! - Classification of FFmpeg failures into fixed codes
//! - Split, stitch, fragment and poster steps
//! - The `TranscodeExecutor` used by workers

pub mod classify;
pub mod command;
pub mod error;
pub mod executor;
pub mod probe;
pub mod progress;
pub mod segment;

pub use classify::{classify_stderr, Classified};
pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use executor::{ExecutionOutput, FfmpegExecutor, TranscodeExecutor, TranscodeRequest};
pub use probe::{probe, MediaInfo, StreamInfo};
pub use progress::{DeltaThrottle, FfmpegProgress, ProgressSink};
pub use segment::Chunk;
