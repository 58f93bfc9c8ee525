//! Layout of a task's scratch directory.
//!
//! ```text
//! {work_dir}/{task_id}/
//!     source/    downloaded source (removed once split)
//!     chunks/    video chunks served to workers
//!     audios/    unmuxed audio tracks served to workers
//!     encoded/   outputs uploaded by workers
//!     assets/    stitched and finalized outputs
//! ```

use std::path::{Component, Path, PathBuf};

use tracing::warn;
use trx_models::TaskId;

pub const SOURCE_DIR: &str = "source";
pub const CHUNKS_DIR: &str = "chunks";
pub const AUDIOS_DIR: &str = "audios";
pub const ENCODED_DIR: &str = "encoded";
pub const ASSETS_DIR: &str = "assets";

/// Resolve a worker-supplied relative path inside `task_dir`.
///
/// Only plain relative paths below `chunks/` or `audios/` are served.
pub fn resolve_servable(task_dir: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    let mut components = rel.components();

    match components.next() {
        Some(Component::Normal(first)) if first == CHUNKS_DIR || first == AUDIOS_DIR => {}
        _ => return None,
    }
    if !components.all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(task_dir.join(rel))
}

/// Whether `name` is a plain file name safe to write under `encoded/`.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Remove a directory tree, logging instead of failing.
pub async fn remove_dir(id: &TaskId, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(task_id = %id, dir = %dir.display(), error = %e, "Failed to remove directory"),
    }
}
