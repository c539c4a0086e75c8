//! Staleness sealing: moving stuck or finished query trees to a terminal state.
//!
//! A single pass ([`StalenessSealer::run_once`]) has two parts:
//!
//! 1. **Stale path**: every query whose deadline has passed and that is not yet
//!    resolved is escalated through the legal transitions to a terminal state,
//!    marked stale and persisted. Children are processed before roots so a
//!    root's quorum decision sees its children's final states.
//! 2. **Early completion path**: EXECUTING roots whose children have all
//!    reported before the deadline get their quorum decision now. They are
//!    not marked stale.
//!
//! Roots that end up COMPLETED are aggregated and published, at most once
//! per pass.
//!
//! ## Escalation
//!
//! | Reloaded state | Transitions |
//! |----------------|-------------|
//! | SUBMITTED | queue, start, fail |
//! | QUEUED | start, fail |
//! | EXECUTING root | quorum decision |
//! | EXECUTING child | stop, fail |
//! | STOPPED | fail |
//! | COMPLETED, FAILED | none (warning) |
//!
//! EXECUTING queries also get a best-effort `stop_query` signal first.
//!
//! ## Isolation
//!
//! Every query yields its own [`QueryOutcome`]. A failure for one query is
//! recorded and the pass moves on. A version conflict leaves the query for
//! the next pass.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;

use federa_core::QueryId;
use federa_core::observability::query_span;

use crate::aggregate::AggregationEngine;
use crate::config::{AggregationConfig, DEFAULT_HISTORY_SOURCE, EngineConfig};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::metrics::{FederaMetrics, time_sealer_pass};
use crate::query::{QueryContext, QueryState};
use crate::store::{CasResult, QueryContextStore};

/// Which part of the pass found the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SealPath {
    /// Deadline passed.
    Stale,
    /// All children reported before the deadline.
    EarlyCompletion,
}

impl SealPath {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::EarlyCompletion => "early_completion",
        }
    }
}

/// Where in the per-query pipeline something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SealStage {
    /// Reloading the query or its children.
    Load,
    /// Sending `stop_query`.
    Stop,
    /// Applying a state transition.
    Transition,
    /// Writing the query back.
    Persist,
    /// Building the federated result.
    Aggregate,
    /// Handing the result to the dispatcher.
    Publish,
}

impl SealStage {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Stop => "stop",
            Self::Transition => "transition",
            Self::Persist => "persist",
            Self::Aggregate => "aggregate",
            Self::Publish => "publish",
        }
    }
}

/// What happened to one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Disposition {
    /// Reached and persisted a state.
    Sealed {
        /// The persisted state.
        state: QueryState,
        /// Whether a federated result was published.
        published: bool,
    },
    /// Nothing to do.
    Skipped {
        /// Why the query was skipped.
        reason: String,
    },
    /// Another writer updated the query first; it stays pending.
    Conflict {
        /// The version this pass read.
        expected_version: u64,
    },
    /// Processing failed.
    Errored {
        /// The failing stage.
        stage: SealStage,
        /// Error description.
        message: String,
    },
}

impl Disposition {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Sealed { .. } => "sealed",
            Self::Skipped { .. } => "skipped",
            Self::Conflict { .. } => "conflict",
            Self::Errored { .. } => "errored",
        }
    }
}

/// A non-fatal failure recorded while sealing a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageError {
    /// The stage that failed.
    pub stage: SealStage,
    /// Error description.
    pub message: String,
}

/// Outcome for one query in a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryOutcome {
    /// The query.
    pub query_id: QueryId,
    /// How it was found.
    pub path: SealPath,
    /// What happened.
    pub disposition: Disposition,
    /// Best-effort failures that did not stop sealing.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<StageError>,
}

/// A finder failure; the affected path was skipped for this pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassError {
    /// The path whose finder failed.
    pub path: SealPath,
    /// Error description.
    pub message: String,
}

/// Summary of one sealer pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SealReport {
    /// The instant the pass ran at.
    pub now: DateTime<Utc>,
    /// One entry per query considered.
    pub outcomes: Vec<QueryOutcome>,
    /// Pass-level failures.
    pub errors: Vec<PassError>,
}

impl SealReport {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            outcomes: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Number of queries sealed.
    #[must_use]
    pub fn sealed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.disposition, Disposition::Sealed { .. }))
            .count()
    }

    /// Number of federated results published.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.disposition, Disposition::Sealed { published: true, .. }))
            .count()
    }

    /// Returns true if nothing errored, conflicted or failed at pass level.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
            && self.outcomes.iter().all(|o| {
                matches!(
                    o.disposition,
                    Disposition::Sealed { .. } | Disposition::Skipped { .. }
                ) && o.warnings.is_empty()
            })
    }

    /// Finds the outcome for a query.
    #[must_use]
    pub fn outcome_for(&self, query_id: QueryId) -> Option<&QueryOutcome> {
        self.outcomes.iter().find(|o| o.query_id == query_id)
    }
}

/// A failure tagged with the stage it happened in.
struct StageFailure {
    stage: SealStage,
    error: Error,
}

trait AtStage<T> {
    fn at_stage(self, stage: SealStage) -> std::result::Result<T, StageFailure>;
}

impl<T> AtStage<T> for Result<T> {
    fn at_stage(self, stage: SealStage) -> std::result::Result<T, StageFailure> {
        self.map_err(|error| StageFailure { stage, error })
    }
}

type StageResult<T> = std::result::Result<T, StageFailure>;

/// Resolves stale and fully-reported query trees.
pub struct StalenessSealer {
    store: Arc<dyn QueryContextStore>,
    dispatcher: Arc<dyn Dispatcher>,
    engine: AggregationEngine,
    history_source: String,
    metrics: FederaMetrics,
}

impl std::fmt::Debug for StalenessSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StalenessSealer")
            .field("engine", &self.engine)
            .field("history_source", &self.history_source)
            .finish_non_exhaustive()
    }
}

impl StalenessSealer {
    /// Creates a sealer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the aggregation settings are invalid.
    pub fn new(
        store: Arc<dyn QueryContextStore>,
        dispatcher: Arc<dyn Dispatcher>,
        aggregation: AggregationConfig,
    ) -> Result<Self> {
        let engine = AggregationEngine::new(Arc::clone(&store), aggregation)?;
        Ok(Self {
            store,
            dispatcher,
            engine,
            history_source: DEFAULT_HISTORY_SOURCE.to_string(),
            metrics: FederaMetrics::new(),
        })
    }

    /// Creates a sealer from engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the aggregation settings are invalid.
    pub fn from_config(
        store: Arc<dyn QueryContextStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: &EngineConfig,
    ) -> Result<Self> {
        Ok(Self::new(store, dispatcher, config.aggregation.clone())?
            .with_history_source(config.sealer.history_source.clone()))
    }

    /// Sets the source name written into status history.
    #[must_use]
    pub fn with_history_source(mut self, source: impl Into<String>) -> Self {
        self.history_source = source.into();
        self
    }

    /// The aggregation engine used for completed roots.
    #[must_use]
    pub const fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    /// Runs one sealing pass at `now`.
    #[tracing::instrument(skip(self), fields(now = %now))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> SealReport {
        let _timer = time_sealer_pass();
        let mut report = SealReport::new(now);
        let mut published: HashSet<QueryId> = HashSet::new();

        match self.store.find_stale_queries(now).await {
            Ok(stale) => {
                for query in stale {
                    let outcome = self
                        .seal_one(SealPath::Stale, query.id(), now, &mut published)
                        .await;
                    report.outcomes.push(outcome);
                }
            }
            Err(e) => self.record_pass_error(&mut report, SealPath::Stale, &e),
        }

        match self.store.find_executing_not_stale_queries(now).await {
            Ok(roots) => {
                for root in roots {
                    let outcome = self
                        .seal_one(SealPath::EarlyCompletion, root.id(), now, &mut published)
                        .await;
                    report.outcomes.push(outcome);
                }
            }
            Err(e) => self.record_pass_error(&mut report, SealPath::EarlyCompletion, &e),
        }

        tracing::info!(
            outcomes = report.outcomes.len(),
            sealed = report.sealed_count(),
            published = report.published_count(),
            errors = report.errors.len(),
            "sealer pass complete"
        );
        report
    }

    fn record_pass_error(&self, report: &mut SealReport, path: SealPath, error: &Error) {
        tracing::error!(path = path.as_label(), error = %error, "finder failed; path skipped this pass");
        self.metrics
            .record_error(SealStage::Load.as_label(), error.kind_label());
        report.errors.push(PassError {
            path,
            message: error.to_string(),
        });
    }

    async fn seal_one(
        &self,
        path: SealPath,
        query_id: QueryId,
        now: DateTime<Utc>,
        published: &mut HashSet<QueryId>,
    ) -> QueryOutcome {
        let span = query_span(path.as_label(), &query_id.to_string());
        let mut warnings = Vec::new();
        let result = match path {
            SealPath::Stale => {
                self.seal_stale(query_id, now, published, &mut warnings)
                    .instrument(span)
                    .await
            }
            SealPath::EarlyCompletion => {
                self.seal_early(query_id, now, published)
                    .instrument(span)
                    .await
            }
        };

        let disposition = match result {
            Ok(disposition) => disposition,
            Err(StageFailure { stage, error }) => {
                tracing::warn!(stage = stage.as_label(), error = %error, "sealing failed");
                self.metrics
                    .record_error(stage.as_label(), error.kind_label());
                Disposition::Errored {
                    stage,
                    message: error.to_string(),
                }
            }
        };
        self.metrics
            .record_outcome(path.as_label(), disposition.as_label());

        QueryOutcome {
            query_id,
            path,
            disposition,
            warnings,
        }
    }

    async fn seal_stale(
        &self,
        query_id: QueryId,
        now: DateTime<Utc>,
        published: &mut HashSet<QueryId>,
        warnings: &mut Vec<StageError>,
    ) -> StageResult<Disposition> {
        let Some(mut query) = self.store.get(&query_id).await.at_stage(SealStage::Load)? else {
            return Ok(skipped("query no longer exists"));
        };
        if query.is_stale() {
            return Ok(skipped("already stale"));
        }

        if query.state() == QueryState::Executing {
            if let Err(e) = self.dispatcher.stop_query(&query).await {
                tracing::warn!(error = %e, "stop_query failed; continuing to seal");
                self.record_warning(warnings, SealStage::Stop, &e);
            }
        }

        let children = if query.is_root() {
            self.store
                .find_children(&query.id())
                .await
                .at_stage(SealStage::Load)?
        } else {
            Vec::new()
        };

        self.escalate(&mut query, &children, now)
            .at_stage(SealStage::Transition)?;
        query.mark_stale(&self.history_source, now);

        if let Some(disposition) = self.persist(&mut query).await? {
            return Ok(disposition);
        }
        if !query.is_root() {
            if let Err(e) = self.engine.update_parent_state(&query).await {
                tracing::warn!(error = %e, "parent refresh failed; child already sealed");
                self.record_warning(warnings, SealStage::Aggregate, &e);
            }
        }
        let published_now = self
            .publish_if_completed(&query, &children, now, published)
            .await?;
        Ok(Disposition::Sealed {
            state: query.state(),
            published: published_now,
        })
    }

    fn record_warning(&self, warnings: &mut Vec<StageError>, stage: SealStage, error: &Error) {
        self.metrics.record_error(stage.as_label(), error.kind_label());
        warnings.push(StageError {
            stage,
            message: error.to_string(),
        });
    }

    async fn seal_early(
        &self,
        root_id: QueryId,
        now: DateTime<Utc>,
        published: &mut HashSet<QueryId>,
    ) -> StageResult<Disposition> {
        let Some(mut root) = self.store.get(&root_id).await.at_stage(SealStage::Load)? else {
            return Ok(skipped("query no longer exists"));
        };
        if root.is_stale() {
            return Ok(skipped("already stale"));
        }
        if root.state() != QueryState::Executing {
            return Ok(skipped("root no longer executing"));
        }

        let children = self
            .store
            .find_children(&root.id())
            .await
            .at_stage(SealStage::Load)?;
        if children.is_empty() || children.iter().any(|c| !c.is_terminal()) {
            return Ok(skipped("children still running"));
        }

        self.decide_quorum(&mut root, &children, now)
            .at_stage(SealStage::Transition)?;

        if let Some(disposition) = self.persist(&mut root).await? {
            return Ok(disposition);
        }
        let published_now = self
            .publish_if_completed(&root, &children, now, published)
            .await?;
        Ok(Disposition::Sealed {
            state: root.state(),
            published: published_now,
        })
    }

    /// Drives a reloaded query to its sealed state.
    ///
    /// The caller refreshes the parent after a child is persisted.
    fn escalate(
        &self,
        query: &mut QueryContext,
        children: &[QueryContext],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let source = self.history_source.as_str();
        let reason = "deadline passed";
        match query.state() {
            QueryState::Submitted => {
                query.queue(source, now)?;
                query.start(source, now)?;
                query.fail(source, reason, now)
            }
            QueryState::Queued => {
                query.start(source, now)?;
                query.fail(source, reason, now)
            }
            QueryState::Executing if query.is_root() => self.decide_quorum(query, children, now),
            QueryState::Executing => {
                query.stop(source, reason, now)?;
                query.fail(source, reason, now)
            }
            QueryState::Stopped => query.fail(source, reason, now),
            QueryState::Completed | QueryState::Failed => {
                tracing::warn!(state = %query.state(), "resolved query returned by stale finder; marking stale only");
                Ok(())
            }
        }
    }

    /// Completes the root if enough children completed, otherwise fails it.
    fn decide_quorum(
        &self,
        root: &mut QueryContext,
        children: &[QueryContext],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let completed = children
            .iter()
            .filter(|c| c.state() == QueryState::Completed)
            .count();
        let required = usize::try_from(root.min_responding_data_sources()).unwrap_or(usize::MAX);

        if completed >= required {
            let result = AggregationEngine::root_result_context(root, children);
            tracing::info!(completed, required, "quorum reached");
            root.finish(&self.history_source, result, now)
        } else {
            tracing::info!(completed, required, "quorum not reached");
            root.fail(
                &self.history_source,
                &format!("{completed} of {required} required data sources completed"),
                now,
            )
        }
    }

    /// Writes the query back. Returns a disposition if the write did not apply.
    async fn persist(&self, query: &mut QueryContext) -> StageResult<Option<Disposition>> {
        let expected_version = query.version();
        match self.store.update(query).await.at_stage(SealStage::Persist)? {
            CasResult::Success => Ok(None),
            CasResult::NotFound => Ok(Some(skipped("query disappeared before persist"))),
            CasResult::VersionConflict { actual } => {
                tracing::info!(expected_version, actual, "version conflict; leaving for next pass");
                Ok(Some(Disposition::Conflict { expected_version }))
            }
        }
    }

    async fn publish_if_completed(
        &self,
        query: &QueryContext,
        children: &[QueryContext],
        now: DateTime<Utc>,
        published: &mut HashSet<QueryId>,
    ) -> StageResult<bool> {
        if !query.is_root() || query.state() != QueryState::Completed {
            return Ok(false);
        }
        if !published.insert(query.id()) {
            tracing::debug!("already published in this pass");
            return Ok(false);
        }

        let result = self.engine.aggregate(query, children, now);
        match self.dispatcher.publish_federated_result(query, &result).await {
            Ok(()) => {
                self.metrics.record_publication("success");
                tracing::info!(num_records = ?result.num_records, "published federated result");
                Ok(true)
            }
            Err(error) => {
                self.metrics.record_publication("failure");
                Err(StageFailure {
                    stage: SealStage::Publish,
                    error,
                })
            }
        }
    }
}

fn skipped(reason: &str) -> Disposition {
    Disposition::Skipped {
        reason: reason.to_string(),
    }
}
