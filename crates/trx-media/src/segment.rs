//! Split, stitch, fragment and poster steps built on [`FfmpegCommand`].

use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tracing::debug;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// One piece of a split source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub num: u32,
    pub path: PathBuf,
    pub size: u64,
}

impl Chunk {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Number encoded in names like `chunk_007.mp4` or `part_00007.mp4`.
pub fn chunk_number(file_name: &str) -> Option<u32> {
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    let (_, num) = stem.rsplit_once('_')?;
    num.parse().ok()
}

fn runner(cancel: &watch::Receiver<bool>) -> FfmpegRunner {
    FfmpegRunner::new().with_cancel(cancel.clone())
}

/// Cut the video stream into segments of roughly `segment_seconds` each,
/// without re-encoding. Audio is dropped.
pub async fn split_video(
    src: &str,
    dst_dir: &Path,
    segment_seconds: u32,
    cancel: &watch::Receiver<bool>,
) -> MediaResult<Vec<Chunk>> {
    tokio::fs::create_dir_all(dst_dir).await?;

    let pattern = dst_dir.join("chunk_%03d.mp4");
    let segment_time = segment_seconds.max(1).to_string();
    let cmd = FfmpegCommand::new(src, &pattern)
        .copy()
        .no_audio()
        .output_args([
            "-f",
            "segment",
            "-segment_time",
            segment_time.as_str(),
            "-segment_format",
            "mp4",
            "-reset_timestamps",
            "1",
        ]);
    runner(cancel).run(&cmd).await?;

    list_chunks(dst_dir).await
}

/// Chunks in `dir`, ordered by number.
pub async fn list_chunks(dir: &Path) -> MediaResult<Vec<Chunk>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut chunks = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(num) = chunk_number(&name) else {
            continue;
        };
        chunks.push(Chunk {
            num,
            path: entry.path(),
            size: meta.len(),
        });
    }

    chunks.sort_by_key(|c| c.num);
    Ok(chunks)
}

/// Copy one audio stream (by absolute index) into its own file.
pub async fn extract_audio(
    src: &str,
    stream_index: u32,
    dst: &Path,
    cancel: &watch::Receiver<bool>,
) -> MediaResult<PathBuf> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let cmd = FfmpegCommand::new(src, dst)
        .output_args(["-map".to_string(), format!("0:{stream_index}")])
        .no_video()
        .audio_codec("copy");
    runner(cancel).run(&cmd).await?;
    Ok(dst.to_path_buf())
}

/// Concatenate encoded parts (ordered by part number) into `dst`.
pub async fn stitch(
    parts: &[PathBuf],
    dst: &Path,
    cancel: &watch::Receiver<bool>,
) -> MediaResult<PathBuf> {
    if parts.is_empty() {
        return Err(MediaError::invalid_media("no parts to stitch"));
    }
    let dir = dst
        .parent()
        .ok_or_else(|| MediaError::internal("stitch output has no parent directory"))?;
    tokio::fs::create_dir_all(dir).await?;

    let list = dst.with_extension("txt");
    tokio::fs::write(&list, concat_list(parts)?).await?;
    debug!(list = %list.display(), parts = parts.len(), "Stitching parts");

    let cmd = FfmpegCommand::new(&list, dst)
        .input_args(["-f", "concat", "-safe", "0"])
        .copy()
        .output_args(["-fflags", "+genpts"])
        .faststart();
    runner(cancel).run(&cmd).await?;

    let _ = tokio::fs::remove_file(&list).await;
    Ok(dst.to_path_buf())
}

/// Body of an ffmpeg concat list, parts sorted by their number.
pub fn concat_list(parts: &[PathBuf]) -> MediaResult<String> {
    let mut numbered = parts
        .iter()
        .map(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            chunk_number(name)
                .map(|n| (n, p))
                .ok_or_else(|| MediaError::invalid_media(format!("bad part name: {}", p.display())))
        })
        .collect::<MediaResult<Vec<_>>>()?;
    numbered.sort_by_key(|(n, _)| *n);

    Ok(numbered
        .into_iter()
        .map(|(_, p)| format!("file '{}'\n", p.display()))
        .collect())
}

/// Rewrite an MP4 as fragmented MP4 with `frag_seconds` fragments.
pub async fn fragment(
    src: &Path,
    dst: &Path,
    frag_seconds: u32,
    cancel: &watch::Receiver<bool>,
) -> MediaResult<PathBuf> {
    let cmd = FfmpegCommand::new(src, dst).copy().output_args([
        "-movflags".to_string(),
        "+faststart+frag_keyframe+empty_moov+default_base_moof".to_string(),
        "-frag_duration".to_string(),
        (u64::from(frag_seconds.max(1)) * 1_000_000).to_string(),
        "-f".to_string(),
        "mp4".to_string(),
    ]);
    runner(cancel).run(&cmd).await?;
    Ok(dst.to_path_buf())
}

/// Pick a representative frame from the first minute.
pub async fn poster(
    src: &Path,
    dst: &Path,
    threads: u32,
    cancel: &watch::Receiver<bool>,
) -> MediaResult<PathBuf> {
    let cmd = FfmpegCommand::new(src, dst)
        .duration(60.0)
        .video_filter("thumbnail")
        .single_frame()
        .output_args(["-update", "1", "-qscale:v", "2"])
        .threads(threads);
    runner(cancel).run(&cmd).await?;
    Ok(dst.to_path_buf())
}
