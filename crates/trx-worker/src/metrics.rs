//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}

pub mod names {
    pub const SUBTASKS_TOTAL: &str = "trx_worker_subtasks_total";
    pub const SUBTASK_DURATION_SECONDS: &str = "trx_worker_subtask_duration_seconds";
    pub const DISPATCH_POLLS_TOTAL: &str = "trx_worker_dispatch_polls_total";

    // Slots
    pub const ADMISSION_REJECTIONS_TOTAL: &str = "trx_admission_rejections_total";
    pub const SLOT_IN_PROGRESS: &str = "trx_slot_in_progress";
    pub const SLOT_WEIGHT: &str = "trx_slot_weight";

    pub const WORKDIR_REMOVED_TOTAL: &str = "trx_worker_workdir_removed_total";
}

/// `outcome` is one of `success`, `failed`, `gone`, `reset`.
pub fn record_subtask(kind: &str, outcome: &str, duration_secs: f64) {
    let labels = [("kind", kind.to_string()), ("outcome", outcome.to_string())];
    counter!(names::SUBTASKS_TOTAL, &labels).increment(1);
    histogram!(names::SUBTASK_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_poll(result: &str) {
    let labels = [("result", result.to_string())];
    counter!(names::DISPATCH_POLLS_TOTAL, &labels).increment(1);
}

pub fn record_admission_rejection() {
    counter!(names::ADMISSION_REJECTIONS_TOTAL).increment(1);
}

pub fn set_slot_load(slot: usize, in_progress: u32, weight: u32) {
    let labels = [("slot", slot.to_string())];
    gauge!(names::SLOT_IN_PROGRESS, &labels).set(in_progress as f64);
    gauge!(names::SLOT_WEIGHT, &labels).set(weight as f64);
}

pub fn record_workdir_removed(reason: &str, count: usize) {
    let labels = [("reason", reason.to_string())];
    counter!(names::WORKDIR_REMOVED_TOTAL, &labels).increment(count as u64);
}
