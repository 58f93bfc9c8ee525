//! Sanity checks around the split and assemble phases.

use trx_models::ErrorDomain;

use crate::error::{ComposerError, ComposerResult};

/// Allowed gap between the source duration and the summed chunk durations.
pub const SPLIT_TOLERANCE_SECS: f64 = 0.5;
/// Allowed gap between the task duration and the stitched output.
pub const ASSEMBLE_TOLERANCE_SECS: f64 = 1.0;

/// One split chunk as seen by validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCheck {
    pub name: String,
    pub size: u64,
    pub duration: f64,
}

/// Checks a split before any subtask is enqueued: at least one chunk, no
/// empty chunk, and the chunks together cover the source.
pub fn pre_validate(chunks: &[ChunkCheck], source_duration: f64) -> ComposerResult<()> {
    if chunks.is_empty() {
        return Err(ComposerError::validation(ErrorDomain::Splitter, "split produced no video chunks"));
    }

    if let Some(empty) = chunks.iter().find(|c| c.size == 0 || c.duration <= 0.0) {
        return Err(ComposerError::validation(
            ErrorDomain::Splitter,
            format!("chunk {} is empty", empty.name),
        ));
    }

    let total: f64 = chunks.iter().map(|c| c.duration).sum();
    if source_duration > 0.0 && (total - source_duration).abs() >= SPLIT_TOLERANCE_SECS {
        return Err(ComposerError::validation(
            ErrorDomain::Splitter,
            format!("chunks cover {total:.3}s of a {source_duration:.3}s source"),
        ));
    }

    Ok(())
}

/// Checks the stitched video against the duration the task was submitted with.
pub fn post_validate(stitched_duration: f64, task_duration: f64) -> ComposerResult<()> {
    if (stitched_duration - task_duration).abs() > ASSEMBLE_TOLERANCE_SECS {
        return Err(ComposerError::validation(
            ErrorDomain::Assembler,
            format!("stitched output is {stitched_duration:.3}s, task is {task_duration:.3}s"),
        ));
    }
    Ok(())
}
