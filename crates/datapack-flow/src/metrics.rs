//! Observability metrics for the export engine.
//!
//! Exposed via the `metrics` crate facade; install a Prometheus (or other)
//! recorder at process startup to export them.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `datapack_flow_steps_total` | Counter | `from_state`, `to_state` | Step state transitions |
//! | `datapack_flow_step_duration_seconds` | Histogram | `kind`, `state` | Step execution duration |
//! | `datapack_flow_dispatches_total` | Counter | `result` | Dispatch outcomes |
//! | `datapack_flow_requeues_total` | Counter | - | Lock-conflict requeues |
//! | `datapack_flow_interrupts_total` | Counter | `outcome` | Kill-controller interrupts |
//! | `datapack_flow_queue_depth` | Gauge | `queue` | Messages waiting per queue |
//! | `datapack_flow_active_runs` | Gauge | - | Runs currently in flight |
//! | `datapack_flow_archives_total` | Counter | `state` | Archive outcomes |
//! | `datapack_flow_scaler_ticks_total` | Counter | `status` | Fleet scaler tick outcomes |

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: step state transitions.
    pub const STEPS_TOTAL: &str = "datapack_flow_steps_total";
    /// Histogram: step execution duration in seconds.
    pub const STEP_DURATION_SECONDS: &str = "datapack_flow_step_duration_seconds";
    /// Counter: dispatch outcomes.
    pub const DISPATCHES_TOTAL: &str = "datapack_flow_dispatches_total";
    /// Counter: lock-conflict requeues.
    pub const REQUEUES_TOTAL: &str = "datapack_flow_requeues_total";
    /// Counter: kill-controller interrupts.
    pub const INTERRUPTS_TOTAL: &str = "datapack_flow_interrupts_total";
    /// Gauge: messages waiting per queue.
    pub const QUEUE_DEPTH: &str = "datapack_flow_queue_depth";
    /// Gauge: runs currently in flight.
    pub const ACTIVE_RUNS: &str = "datapack_flow_active_runs";
    /// Counter: archive outcomes.
    pub const ARCHIVES_TOTAL: &str = "datapack_flow_archives_total";
    /// Counter: fleet scaler tick outcomes.
    pub const SCALER_TICKS_TOTAL: &str = "datapack_flow_scaler_ticks_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Step kind label.
    pub const KIND: &str = "kind";
    /// Terminal state label.
    pub const STATE: &str = "state";
    /// Dispatch/tick outcome.
    pub const RESULT: &str = "result";
    /// Interrupt outcome.
    pub const OUTCOME: &str = "outcome";
    /// Queue name.
    pub const QUEUE: &str = "queue";
    /// Scaler tick status.
    pub const STATUS: &str = "status";
}

/// High-level recorder for engine metrics. Cheap to clone and share.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a step state transition.
    pub fn record_step_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::STEPS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records a step's execution duration.
    pub fn observe_step_duration(&self, kind: &str, final_state: &str, duration_secs: f64) {
        histogram!(
            names::STEP_DURATION_SECONDS,
            labels::KIND => kind.to_string(),
            labels::STATE => final_state.to_string(),
        )
        .record(duration_secs);
    }

    /// Records a dispatch outcome.
    pub fn record_dispatch(&self, result: &str) {
        counter!(
            names::DISPATCHES_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a lock-conflict requeue.
    pub fn record_requeue(&self) {
        counter!(names::REQUEUES_TOTAL).increment(1);
    }

    /// Records an interrupt outcome (`killed`, `stale`, `raced`).
    pub fn record_interrupt(&self, outcome: &str) {
        counter!(
            names::INTERRUPTS_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Updates a queue depth gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        gauge!(
            names::QUEUE_DEPTH,
            labels::QUEUE => queue.to_string(),
        )
        .set(depth as f64);
    }

    /// Updates the active-run gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_runs(&self, count: usize) {
        gauge!(names::ACTIVE_RUNS).set(count as f64);
    }

    /// Records an archive outcome.
    pub fn record_archive(&self, state: &str) {
        counter!(
            names::ARCHIVES_TOTAL,
            labels::STATE => state.to_string(),
        )
        .increment(1);
    }

    /// Records a fleet scaler tick outcome.
    pub fn record_scaler_tick(&self, status: &str) {
        counter!(
            names::SCALER_TICKS_TOTAL,
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_is_a_noop() {
        // The metrics facade drops everything when no recorder is
        // installed; these must not panic.
        let metrics = FlowMetrics::new();
        metrics.record_step_transition("pending", "running");
        metrics.observe_step_duration("convert_gpkg", "succeeded", 12.5);
        metrics.record_dispatch("enqueued");
        metrics.record_requeue();
        metrics.record_interrupt("killed");
        metrics.set_queue_depth("datapack.worker-1", 3);
        metrics.set_active_runs(1);
        metrics.record_archive("success");
        metrics.record_scaler_tick("ok");
    }
}
