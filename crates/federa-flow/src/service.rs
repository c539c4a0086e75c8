//! Periodic sealer service.
//!
//! Wraps a [`StalenessSealer`] in a fixed-interval loop. At most one pass
//! runs at a time: a tick or manual trigger that arrives while a pass is
//! running is skipped and counted, never queued.
//!
//! Shutdown is observed between passes, so a pass that has started always
//! finishes.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use federa_core::observability::sealer_span;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::dispatch::Dispatcher;
use crate::metrics::FederaMetrics;
use crate::sealer::{SealReport, StalenessSealer};
use crate::store::QueryContextStore;

/// Resets the in-progress flag when a pass ends, including on cancellation.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs sealer passes on a schedule or on demand.
#[derive(Debug)]
pub struct SealerService {
    sealer: Arc<StalenessSealer>,
    interval: Duration,
    pass_in_progress: AtomicBool,
    passes_completed: AtomicU64,
    passes_skipped: AtomicU64,
    metrics: FederaMetrics,
}

impl SealerService {
    /// Creates a service around `sealer`.
    #[must_use]
    pub fn new(sealer: StalenessSealer, interval: Duration) -> Self {
        Self {
            sealer: Arc::new(sealer),
            interval,
            pass_in_progress: AtomicBool::new(false),
            passes_completed: AtomicU64::new(0),
            passes_skipped: AtomicU64::new(0),
            metrics: FederaMetrics::new(),
        }
    }

    /// Creates a service using the sealer and aggregation settings of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`](crate::error::Error::Configuration) if
    /// the aggregation settings are invalid.
    pub fn from_config(
        store: Arc<dyn QueryContextStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let sealer = StalenessSealer::from_config(store, dispatcher, config)?;
        Ok(Self::new(sealer, config.sealer.interval))
    }

    /// Time between scheduled passes.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// The wrapped sealer.
    #[must_use]
    pub fn sealer(&self) -> &StalenessSealer {
        &self.sealer
    }

    /// Returns true while a pass is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pass_in_progress.load(Ordering::Acquire)
    }

    /// Number of passes that ran to completion.
    #[must_use]
    pub fn passes_completed(&self) -> u64 {
        self.passes_completed.load(Ordering::Acquire)
    }

    /// Number of triggers skipped because a pass was already running.
    #[must_use]
    pub fn passes_skipped(&self) -> u64 {
        self.passes_skipped.load(Ordering::Acquire)
    }

    /// Runs one pass at `now` unless another pass is in progress.
    ///
    /// Returns `None` if the trigger was skipped.
    pub async fn trigger(&self, now: DateTime<Utc>) -> Option<SealReport> {
        if self
            .pass_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.passes_skipped.fetch_add(1, Ordering::AcqRel);
            self.metrics.record_skipped_pass();
            tracing::warn!("sealer pass already in progress; skipping trigger");
            return None;
        }
        let _guard = PassGuard(&self.pass_in_progress);

        let pass = self.passes_completed.load(Ordering::Acquire) + 1;
        let report = self
            .sealer
            .run_once(now)
            .instrument(sealer_span(pass))
            .await;
        self.passes_completed.fetch_add(1, Ordering::AcqRel);
        Some(report)
    }

    /// Runs passes every [`interval`](Self::interval) until `shutdown` resolves.
    ///
    /// The first pass runs immediately. Late ticks are skipped rather than
    /// bunched. Returns the number of passes completed by this loop.
    pub async fn run<F>(&self, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(interval = ?self.interval, "sealer service started");
        let mut completed = 0_u64;
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                _ = timer.tick() => {
                    if let Some(report) = self.trigger(Utc::now()).await {
                        completed += 1;
                        if !report.is_clean() {
                            tracing::warn!(
                                errors = report.errors.len(),
                                outcomes = report.outcomes.len(),
                                "sealer pass finished with problems"
                            );
                        }
                    }
                }
            }
        }
        tracing::info!(passes = completed, "sealer service stopped");
        completed
    }
}
