//! Observability metrics for the array engine.
//!
//! Metrics go through the `metrics` crate facade; installing an exporter is
//! left to the host process.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `fanout_array_rounds_total` | Counter | `outcome` | Reconciliation rounds by resulting array phase |
//! | `fanout_array_round_duration_seconds` | Histogram | - | Reconciliation round time |
//! | `fanout_array_subtasks` | Gauge | `phase` | Subtasks per phase after the latest round |
//! | `fanout_array_launches_total` | Counter | `result` | Launch outcomes |
//! | `fanout_array_resource_releases_total` | Counter | `result` | Admission token releases |
//! | `fanout_array_assembly_jobs_total` | Counter | `queue`, `result` | Assembly job outcomes |
//! | `fanout_array_assembly_duration_seconds` | Histogram | `queue` | Assembly job processing time |
//! | `fanout_array_work_queue_depth` | Gauge | `queue` | Items not yet done per queue |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fanout_array::metrics::ArrayMetrics;
//!
//! let metrics = ArrayMetrics::new();
//! metrics.record_launch("granted");
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

use crate::phase::TaskPhase;
use crate::state::ArrayPhase;
use crate::summary::ArraySummary;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: reconciliation rounds by outcome.
    pub const ROUNDS_TOTAL: &str = "fanout_array_rounds_total";
    /// Histogram: reconciliation round time in seconds.
    pub const ROUND_DURATION_SECONDS: &str = "fanout_array_round_duration_seconds";
    /// Gauge: subtasks per phase after the latest round.
    pub const SUBTASKS: &str = "fanout_array_subtasks";
    /// Counter: launch outcomes.
    pub const LAUNCHES_TOTAL: &str = "fanout_array_launches_total";
    /// Counter: admission token releases.
    pub const RESOURCE_RELEASES_TOTAL: &str = "fanout_array_resource_releases_total";
    /// Counter: assembly job outcomes.
    pub const ASSEMBLY_JOBS_TOTAL: &str = "fanout_array_assembly_jobs_total";
    /// Histogram: assembly job processing time in seconds.
    pub const ASSEMBLY_DURATION_SECONDS: &str = "fanout_array_assembly_duration_seconds";
    /// Gauge: items not yet done per work queue.
    pub const WORK_QUEUE_DEPTH: &str = "fanout_array_work_queue_depth";
}

/// Label keys used across metrics.
pub mod labels {
    /// Array phase a round ended in.
    pub const OUTCOME: &str = "outcome";
    /// Subtask phase.
    pub const PHASE: &str = "phase";
    /// Result of an operation.
    pub const RESULT: &str = "result";
    /// Work queue name.
    pub const QUEUE: &str = "queue";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct ArrayMetrics {
    _private: (),
}

impl ArrayMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the array phase a reconciliation round ended in.
    pub fn record_round(&self, outcome: ArrayPhase) {
        counter!(
            names::ROUNDS_TOTAL,
            labels::OUTCOME => outcome.as_label(),
        )
        .increment(1);
    }

    /// Publishes the per-phase subtask counts of a summary.
    ///
    /// Phases missing from the summary are reset to zero.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_subtask_counts(&self, summary: &ArraySummary) {
        for phase in TaskPhase::ALL {
            gauge!(
                names::SUBTASKS,
                labels::PHASE => phase.as_label(),
            )
            .set(summary.count(phase) as f64);
        }
    }

    /// Records a launch outcome (`granted`, `waiting`, `created`, `already_exists`, `forbidden`).
    pub fn record_launch(&self, result: &'static str) {
        counter!(
            names::LAUNCHES_TOTAL,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records a token release (`released`, `not_held`).
    pub fn record_release(&self, result: &'static str) {
        counter!(
            names::RESOURCE_RELEASES_TOTAL,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records an assembly job outcome (`succeeded`, `retried`, `failed`).
    pub fn record_assembly(&self, queue: &str, result: &'static str) {
        counter!(
            names::ASSEMBLY_JOBS_TOTAL,
            labels::QUEUE => queue.to_string(),
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records assembly job processing time.
    pub fn observe_assembly_duration(&self, queue: &str, duration: Duration) {
        histogram!(
            names::ASSEMBLY_DURATION_SECONDS,
            labels::QUEUE => queue.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Sets the number of items not yet done in a queue.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        gauge!(
            names::WORK_QUEUE_DEPTH,
            labels::QUEUE => queue.to_string(),
        )
        .set(depth as f64);
    }
}

/// RAII guard for timing operations.
///
/// Records the elapsed duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that calls `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for a reconciliation round.
#[must_use]
pub fn time_round() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| {
        histogram!(names::ROUND_DURATION_SECONDS).record(duration.as_secs_f64());
    })
}
