//! Observability metrics for federated query orchestration.
//!
//! Metrics go through the `metrics` crate facade; installing an exporter is
//! left to the embedding binary. [`register_metrics`] attaches descriptions
//! to every metric below.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `federa_flow_query_transitions_total` | Counter | `from_state`, `to_state` | Query state transitions |
//! | `federa_flow_sealer_pass_duration_seconds` | Histogram | - | Sealer pass processing time |
//! | `federa_flow_sealer_outcomes_total` | Counter | `path`, `outcome` | Per-query sealing outcomes |
//! | `federa_flow_sealer_errors_total` | Counter | `stage`, `kind` | Errors recorded during sealing |
//! | `federa_flow_sealer_skipped_passes_total` | Counter | - | Passes rejected because one was in flight |
//! | `federa_flow_publications_total` | Counter | `result` | Federated result publications |
//! | `federa_flow_masked_cells_total` | Counter | - | Histogram cells hidden by the privacy mask |
//! | `federa_flow_partial_data_total` | Counter | - | Completed children without a result |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use federa_flow::metrics::FederaMetrics;
//!
//! let metrics = FederaMetrics::new();
//! metrics.record_transition("executing", "completed");
//! metrics.record_masked_cells(3);
//! ```

use std::sync::Once;
use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Total query state transitions.
    pub const QUERY_TRANSITIONS_TOTAL: &str = "federa_flow_query_transitions_total";
    /// Histogram: Sealer pass processing time in seconds.
    pub const SEALER_PASS_DURATION_SECONDS: &str = "federa_flow_sealer_pass_duration_seconds";
    /// Counter: Per-query sealing outcomes.
    pub const SEALER_OUTCOMES_TOTAL: &str = "federa_flow_sealer_outcomes_total";
    /// Counter: Errors recorded during sealing.
    pub const SEALER_ERRORS_TOTAL: &str = "federa_flow_sealer_errors_total";
    /// Counter: Passes rejected because another pass was in flight.
    pub const SEALER_SKIPPED_PASSES_TOTAL: &str = "federa_flow_sealer_skipped_passes_total";
    /// Counter: Federated result publications.
    pub const PUBLICATIONS_TOTAL: &str = "federa_flow_publications_total";
    /// Counter: Histogram cells hidden by the privacy mask.
    pub const MASKED_CELLS_TOTAL: &str = "federa_flow_masked_cells_total";
    /// Counter: Completed children that carried no result.
    pub const PARTIAL_DATA_TOTAL: &str = "federa_flow_partial_data_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous query state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target query state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Sealing path (stale, early_completion).
    pub const PATH: &str = "path";
    /// Outcome kind (sealed, skipped, conflict, errored).
    pub const OUTCOME: &str = "outcome";
    /// Pipeline stage where an error happened.
    pub const STAGE: &str = "stage";
    /// Error kind label.
    pub const KIND: &str = "kind";
    /// Result status (success, failure).
    pub const RESULT: &str = "result";
}

static DESCRIBE: Once = Once::new();

/// Describes every federa-flow metric to the installed recorder.
///
/// Safe to call multiple times; subsequent calls are no-ops. Call it after
/// installing a recorder, since descriptions sent to the no-op recorder are lost.
pub fn register_metrics() {
    DESCRIBE.call_once(|| {
        describe_counter!(names::QUERY_TRANSITIONS_TOTAL, "Query state transitions");
        describe_histogram!(
            names::SEALER_PASS_DURATION_SECONDS,
            metrics::Unit::Seconds,
            "Sealer pass processing time"
        );
        describe_counter!(names::SEALER_OUTCOMES_TOTAL, "Per-query sealing outcomes");
        describe_counter!(names::SEALER_ERRORS_TOTAL, "Errors recorded during sealing");
        describe_counter!(
            names::SEALER_SKIPPED_PASSES_TOTAL,
            "Passes rejected because one was in flight"
        );
        describe_counter!(names::PUBLICATIONS_TOTAL, "Federated result publications");
        describe_counter!(
            names::MASKED_CELLS_TOTAL,
            "Histogram cells hidden by the privacy mask"
        );
        describe_counter!(names::PARTIAL_DATA_TOTAL, "Completed children without a result");
        tracing::debug!("federa-flow metrics described");
    });
}

/// High-level interface for recording orchestration metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FederaMetrics;

impl FederaMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a query state transition.
    pub fn record_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::QUERY_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records the outcome of sealing one query.
    pub fn record_outcome(&self, path: &str, outcome: &str) {
        counter!(
            names::SEALER_OUTCOMES_TOTAL,
            labels::PATH => path.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records an error raised while sealing.
    pub fn record_error(&self, stage: &str, kind: &str) {
        counter!(
            names::SEALER_ERRORS_TOTAL,
            labels::STAGE => stage.to_string(),
            labels::KIND => kind.to_string(),
        )
        .increment(1);
    }

    /// Records a pass that was not started because one was already running.
    pub fn record_skipped_pass(&self) {
        counter!(names::SEALER_SKIPPED_PASSES_TOTAL).increment(1);
    }

    /// Records a federated result publication attempt.
    pub fn record_publication(&self, result: &str) {
        counter!(
            names::PUBLICATIONS_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records cells hidden by the privacy mask.
    pub fn record_masked_cells(&self, count: usize) {
        counter!(names::MASKED_CELLS_TOTAL).increment(count as u64);
    }

    /// Records a completed child that carried no result.
    pub fn record_partial_data(&self) {
        counter!(names::PARTIAL_DATA_TOTAL).increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
///
/// ## Example
///
/// ```rust,no_run
/// use federa_flow::metrics::TimingGuard;
///
/// {
///     let _guard = TimingGuard::new(|duration| {
///         tracing::debug!(elapsed_ms = duration.as_millis(), "step finished");
///     });
///
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
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
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
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

/// Creates a timing guard for sealer pass metrics.
#[must_use]
pub fn time_sealer_pass() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| {
        histogram!(names::SEALER_PASS_DURATION_SECONDS).record(duration.as_secs_f64());
    })
}
