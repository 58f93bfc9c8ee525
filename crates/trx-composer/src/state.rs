//! Application state.

use std::sync::Arc;

use trx_queue::DispatchQueue;

use crate::config::ComposerConfig;
use crate::fan_in::FanIn;
use crate::lifecycle::Lifecycle;
use crate::progress::ProgressTracker;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ComposerConfig>,
    pub lifecycle: Lifecycle,
    pub dispatch: DispatchQueue,
    pub fan_in: FanIn,
    pub progress: ProgressTracker,
}

impl AppState {
    pub fn new(config: Arc<ComposerConfig>, lifecycle: Lifecycle, dispatch: DispatchQueue) -> Self {
        Self {
            fan_in: FanIn::new(lifecycle.clone()),
            progress: ProgressTracker::new(lifecycle.clone()),
            config,
            lifecycle,
            dispatch,
        }
    }
}
