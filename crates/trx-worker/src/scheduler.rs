//! Packing of subtasks onto CPU slots.
//!
//! Each slot stands for one core and carries a weight budget of
//! [`SLOT_BUDGET`]. A subtask is admitted to a slot when both the slot's
//! total weight and its job count stay within limits; running jobs are
//! never evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;
use trx_models::{Subtask, SubtaskPayload};

use crate::metrics;

/// Weight budget of one slot.
pub const SLOT_BUDGET: u32 = 100;
/// Pause before rescanning the slots when no slot admits a job.
pub const RESCAN_INTERVAL: Duration = Duration::from_millis(15);

/// Weight a subtask takes on a slot.
pub trait CostModel: Send + Sync {
    fn weight(&self, subtask: &Subtask, max_tasks_per_slot: u32) -> u32;
}

/// Default weight `budget / max_tasks`, lowered for video jobs whose target
/// codec has a cheaper table entry. Keys are codec names (`h264`, `hevc`),
/// not encoder names.
#[derive(Debug, Clone)]
pub struct CodecCostTable {
    weights: HashMap<String, u32>,
}

impl CodecCostTable {
    pub fn new(weights: HashMap<String, u32>) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &HashMap<String, u32> {
        &self.weights
    }
}

impl Default for CodecCostTable {
    fn default() -> Self {
        Self::new(HashMap::from([("h264".to_string(), 60)]))
    }
}

impl CostModel for CodecCostTable {
    fn weight(&self, subtask: &Subtask, max_tasks_per_slot: u32) -> u32 {
        let default = SLOT_BUDGET / max_tasks_per_slot.max(1);
        match &subtask.payload {
            SubtaskPayload::Video(job) => self
                .weights
                .get(codec_family(&job.codec))
                .map_or(default, |w| default.min(*w)),
            SubtaskPayload::Audio(_) => default,
        }
    }
}

/// Codec an FFmpeg encoder produces, e.g. `libx264` -> `h264`.
pub fn codec_family(encoder: &str) -> &str {
    match encoder {
        "libx264" | "h264_nvenc" | "h264_qsv" | "h264_vaapi" | "h264_videotoolbox" => "h264",
        "libx265" | "hevc_nvenc" | "hevc_qsv" | "hevc_vaapi" | "hevc_videotoolbox" => "hevc",
        "libvpx-vp9" | "vp9_vaapi" | "vp9_qsv" => "vp9",
        "libaom-av1" | "libsvtav1" | "av1_nvenc" | "av1_qsv" => "av1",
        other => other,
    }
}

/// One core's worth of capacity.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    max_tasks: u32,
    in_progress: AtomicU32,
    weight: AtomicU32,
}

impl Slot {
    pub fn new(index: usize, max_tasks: u32) -> Self {
        Self {
            index,
            max_tasks: max_tasks.max(1),
            in_progress: AtomicU32::new(0),
            weight: AtomicU32::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn in_progress(&self) -> u32 {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::SeqCst)
    }

    /// Tentatively take `weight`; rolled back unless both limits hold.
    fn try_take(&self, weight: u32) -> bool {
        let count = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.weight.fetch_add(weight, Ordering::SeqCst) + weight;

        if total > SLOT_BUDGET || count > self.max_tasks {
            self.release(weight);
            return false;
        }
        true
    }

    fn release(&self, weight: u32) {
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        self.weight.fetch_sub(weight, Ordering::SeqCst);
    }
}

/// A job's hold on a slot. Dropping it releases exactly what was taken.
#[derive(Debug)]
pub struct Admission {
    slot: Arc<Slot>,
    weight: u32,
}

impl Admission {
    pub fn slot(&self) -> usize {
        self.slot.index
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.slot.release(self.weight);
        metrics::set_slot_load(self.slot.index, self.slot.in_progress(), self.slot.weight());
    }
}

pub struct AdmissionScheduler {
    slots: Vec<Arc<Slot>>,
    cost: Arc<dyn CostModel>,
    max_tasks_per_slot: u32,
}

impl AdmissionScheduler {
    pub fn new(slot_count: usize, max_tasks_per_slot: u32, cost: Arc<dyn CostModel>) -> Self {
        let max_tasks_per_slot = max_tasks_per_slot.max(1);
        let slots = (0..slot_count.max(1))
            .map(|i| Arc::new(Slot::new(i, max_tasks_per_slot)))
            .collect();
        Self {
            slots,
            cost,
            max_tasks_per_slot,
        }
    }

    pub fn slots(&self) -> &[Arc<Slot>] {
        &self.slots
    }

    /// One pass over the slots, least busy first.
    pub fn try_admit(&self, subtask: &Subtask) -> Option<Admission> {
        let weight = self.cost.weight(subtask, self.max_tasks_per_slot);

        let mut order: Vec<&Arc<Slot>> = self.slots.iter().collect();
        order.sort_by_key(|s| s.in_progress());

        for slot in order {
            if slot.try_take(weight) {
                debug!(
                    task_id = %subtask.task_id,
                    part = subtask.part,
                    slot = slot.index,
                    weight,
                    slot_weight = slot.weight(),
                    in_progress = slot.in_progress(),
                    "Subtask admitted"
                );
                metrics::set_slot_load(slot.index, slot.in_progress(), slot.weight());
                return Some(Admission {
                    slot: Arc::clone(slot),
                    weight,
                });
            }
        }

        metrics::record_admission_rejection();
        None
    }

    /// Wait until some slot admits `subtask`. Returns `None` if `shutdown`
    /// flips first.
    pub async fn admit(&self, subtask: &Subtask, shutdown: &mut watch::Receiver<bool>) -> Option<Admission> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            if let Some(admission) = self.try_admit(subtask) {
                return Some(admission);
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(RESCAN_INTERVAL) => {}
            }
        }
    }
}
