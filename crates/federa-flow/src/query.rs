//! Query contexts and their lifecycle state machine.
//!
//! This module provides:
//! - `QueryState`: The table-driven lifecycle of a query
//! - `QueryOperation`: The operations that move a query between states
//! - `QueryContext`: One node of a query tree (root or per-data-source child)
//! - `ResultContext` / `ResultRecord`: What a data source reported
//! - `StatusEntry`: Append-only audit trail of lifecycle events

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use federa_core::{DataSourceId, QueryId};

use crate::error::{Error, Result};
use crate::metrics::FederaMetrics;

/// Lifecycle state of a query context.
///
/// ```text
/// ┌───────────┐     ┌────────┐     ┌───────────┐     ┌───────────┐
/// │ SUBMITTED │────►│ QUEUED │────►│ EXECUTING │────►│ COMPLETED │
/// └───────────┘     └────────┘     └───────────┘     └───────────┘
///                                     │      │
///                                     │      └─────────────┐
///                                     ▼                    ▼
///                                ┌─────────┐          ┌────────┐
///                                │ STOPPED │─────────►│ FAILED │
///                                └─────────┘          └────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    /// Created, not yet handed to any data source.
    Submitted,
    /// Accepted for execution.
    Queued,
    /// Running at the data source (or, for a root, at its children).
    Executing,
    /// Finished with a result.
    Completed,
    /// Finished without a usable result.
    Failed,
    /// Halted by cancellation or the sealer; only failure can follow.
    Stopped,
}

impl QueryState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Submitted,
        Self::Queued,
        Self::Executing,
        Self::Completed,
        Self::Failed,
        Self::Stopped,
    ];

    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Submitted => matches!(target, Self::Queued),
            Self::Queued => matches!(target, Self::Executing),
            Self::Executing => matches!(target, Self::Completed | Self::Failed | Self::Stopped),
            Self::Stopped => matches!(target, Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }

    /// Returns all valid target states from the current state.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Submitted => vec![Self::Queued],
            Self::Queued => vec![Self::Executing],
            Self::Executing => vec![Self::Completed, Self::Failed, Self::Stopped],
            Self::Stopped => vec![Self::Failed],
            Self::Completed | Self::Failed => vec![],
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl Default for QueryState {
    fn default() -> Self {
        Self::Submitted
    }
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Queued => write!(f, "QUEUED"),
            Self::Executing => write!(f, "EXECUTING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// A lifecycle operation on a query context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOperation {
    /// `queue`: SUBMITTED -> QUEUED.
    Queue,
    /// `start`: QUEUED -> EXECUTING.
    Start,
    /// `finish`: EXECUTING -> COMPLETED.
    Finish,
    /// `fail`: EXECUTING | STOPPED -> FAILED.
    Fail,
    /// `stop`: EXECUTING -> STOPPED.
    Stop,
}

impl QueryOperation {
    /// All operations.
    pub const ALL: [Self; 5] = [Self::Queue, Self::Start, Self::Finish, Self::Fail, Self::Stop];

    /// The state this operation moves a query into.
    #[must_use]
    pub const fn target_state(&self) -> QueryState {
        match self {
            Self::Queue => QueryState::Queued,
            Self::Start => QueryState::Executing,
            Self::Finish => QueryState::Completed,
            Self::Fail => QueryState::Failed,
            Self::Stop => QueryState::Stopped,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Start => "start",
            Self::Finish => "finish",
            Self::Fail => "fail",
            Self::Stop => "stop",
        }
    }
}

/// One record reported by a data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    /// Linkage token used to match records across data sources.
    pub key: String,
    /// Category name to label, e.g. `gender -> FEMALE`.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ResultRecord {
    /// Creates a record with no attributes.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds a category label to the record.
    #[must_use]
    pub fn with_attribute(mut self, category: impl Into<String>, label: impl Into<String>) -> Self {
        self.attributes.insert(category.into(), label.into());
        self
    }
}

/// Result reported by a data source, or computed for a root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultContext {
    /// Number of matching records.
    pub num_records: u64,
    /// What was counted (e.g. `Patient`).
    pub root_entity: String,
    /// Record-level result set; empty for count-only sources.
    #[serde(default)]
    pub records: Vec<ResultRecord>,
}

impl ResultContext {
    /// Creates a count-only result.
    #[must_use]
    pub fn count_only(root_entity: impl Into<String>, num_records: u64) -> Self {
        Self {
            num_records,
            root_entity: root_entity.into(),
            records: Vec::new(),
        }
    }

    /// Creates a result from records; `num_records` is the record count.
    #[must_use]
    pub fn from_records(root_entity: impl Into<String>, records: Vec<ResultRecord>) -> Self {
        Self {
            num_records: u64::try_from(records.len()).unwrap_or(u64::MAX),
            root_entity: root_entity.into(),
            records,
        }
    }
}

/// One entry of a query's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    /// Component that caused the entry (e.g. `sealer`, `site-north`).
    pub source: String,
    /// Human-readable description.
    pub message: String,
    /// Milliseconds since the previous entry, or since creation for the first.
    pub duration_ms: u64,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
}

/// One node of a query tree.
///
/// A root has no parent and no data source; each child targets exactly one
/// data source. Lifecycle fields are private and change only through the
/// transition operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryContext {
    id: QueryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<QueryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_source_id: Option<DataSourceId>,
    root_entity: String,
    state: QueryState,
    #[serde(default)]
    is_stale: bool,
    stale_at: DateTime<Utc>,
    #[serde(default)]
    min_responding_data_sources: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_context: Option<ResultContext>,
    #[serde(default)]
    status_history: Vec<StatusEntry>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    version: u64,
}

impl QueryContext {
    /// Creates a root query in SUBMITTED state.
    #[must_use]
    pub fn new_root(
        root_entity: impl Into<String>,
        stale_at: DateTime<Utc>,
        min_responding_data_sources: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: QueryId::generate(),
            parent_id: None,
            data_source_id: None,
            root_entity: root_entity.into(),
            state: QueryState::Submitted,
            is_stale: false,
            stale_at,
            min_responding_data_sources,
            result_context: None,
            status_history: Vec::new(),
            created_at: now,
            version: 0,
        }
    }

    /// Creates a child of `root` targeting `data_source`.
    ///
    /// The child inherits the root's entity and deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NestedChildQuery`] if `root` is itself a child.
    pub fn new_child(
        root: &Self,
        data_source: DataSourceId,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let id = QueryId::generate();
        if root.parent_id.is_some() {
            return Err(Error::NestedChildQuery {
                query_id: id,
                parent_id: root.id,
            });
        }

        Ok(Self {
            id,
            parent_id: Some(root.id),
            data_source_id: Some(data_source),
            root_entity: root.root_entity.clone(),
            state: QueryState::Submitted,
            is_stale: false,
            stale_at: root.stale_at,
            min_responding_data_sources: 0,
            result_context: None,
            status_history: Vec::new(),
            created_at: now,
            version: 0,
        })
    }

    /// Unique query ID.
    #[must_use]
    pub const fn id(&self) -> QueryId {
        self.id
    }

    /// Parent query ID; `None` for a root.
    #[must_use]
    pub const fn parent_id(&self) -> Option<QueryId> {
        self.parent_id
    }

    /// Target data source; `None` for a root.
    #[must_use]
    pub const fn data_source_id(&self) -> Option<&DataSourceId> {
        self.data_source_id.as_ref()
    }

    /// What is being counted.
    #[must_use]
    pub fn root_entity(&self) -> &str {
        &self.root_entity
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> QueryState {
        self.state
    }

    /// Whether the sealer forced this query to a conclusion.
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        self.is_stale
    }

    /// Absolute deadline.
    #[must_use]
    pub const fn stale_at(&self) -> DateTime<Utc> {
        self.stale_at
    }

    /// Quorum threshold (meaningful for roots only).
    #[must_use]
    pub const fn min_responding_data_sources(&self) -> u32 {
        self.min_responding_data_sources
    }

    /// Result, if any.
    #[must_use]
    pub const fn result_context(&self) -> Option<&ResultContext> {
        self.result_context.as_ref()
    }

    /// Record count from the result context, or zero.
    #[must_use]
    pub fn num_records(&self) -> u64 {
        self.result_context.as_ref().map_or(0, |rc| rc.num_records)
    }

    /// Append-only audit trail.
    #[must_use]
    pub fn status_history(&self) -> &[StatusEntry] {
        &self.status_history
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Optimistic-concurrency version.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Returns true if this is a root query.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Returns true if the query is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Sets the stored version.
    ///
    /// Store implementations call this after a successful insert or
    /// compare-and-set update.
    pub fn set_stored_version(&mut self, version: u64) {
        self.version = version;
    }

    /// SUBMITTED -> QUEUED.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalStateTransition`] if the query is not SUBMITTED.
    pub fn queue(&mut self, source: &str, at: DateTime<Utc>) -> Result<()> {
        self.apply(QueryOperation::Queue, source, "queued", at)
    }

    /// QUEUED -> EXECUTING.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalStateTransition`] if the query is not QUEUED.
    pub fn start(&mut self, source: &str, at: DateTime<Utc>) -> Result<()> {
        self.apply(QueryOperation::Start, source, "execution started", at)
    }

    /// EXECUTING -> COMPLETED, fixing the result context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalStateTransition`] if the query is not EXECUTING.
    pub fn finish(&mut self, source: &str, result: ResultContext, at: DateTime<Utc>) -> Result<()> {
        let message = format!("completed with {} records", result.num_records);
        self.apply(QueryOperation::Finish, source, &message, at)?;
        self.result_context = Some(result);
        Ok(())
    }

    /// EXECUTING -> COMPLETED for a data source that reported success
    /// without a result. Aggregation treats such a child as partial data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalStateTransition`] if the query is not EXECUTING.
    pub fn finish_without_result(&mut self, source: &str, at: DateTime<Utc>) -> Result<()> {
        self.apply(QueryOperation::Finish, source, "completed without result", at)
    }

    /// EXECUTING | STOPPED -> FAILED.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalStateTransition`] from any other state.
    pub fn fail(&mut self, source: &str, reason: &str, at: DateTime<Utc>) -> Result<()> {
        self.apply(QueryOperation::Fail, source, &format!("failed: {reason}"), at)
    }

    /// EXECUTING -> STOPPED.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalStateTransition`] if the query is not EXECUTING.
    pub fn stop(&mut self, source: &str, reason: &str, at: DateTime<Utc>) -> Result<()> {
        self.apply(QueryOperation::Stop, source, &format!("stopped: {reason}"), at)
    }

    /// Applies an operation by kind. Used by replay tooling and tests.
    ///
    /// `Finish` records an empty count-only result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalStateTransition`] if the operation is not allowed.
    pub fn apply_operation(
        &mut self,
        operation: QueryOperation,
        source: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        match operation {
            QueryOperation::Queue => self.queue(source, at),
            QueryOperation::Start => self.start(source, at),
            QueryOperation::Finish => {
                let result = ResultContext::count_only(self.root_entity.clone(), 0);
                self.finish(source, result, at)
            }
            QueryOperation::Fail => self.fail(source, "requested", at),
            QueryOperation::Stop => self.stop(source, "requested", at),
        }
    }

    /// Marks the query stale. Calling it again is a no-op.
    pub fn mark_stale(&mut self, source: &str, at: DateTime<Utc>) {
        if self.is_stale {
            return;
        }
        self.is_stale = true;
        self.push_history(source, "marked stale", at);
        tracing::debug!(query_id = %self.id, state = %self.state, "query marked stale");
    }

    /// Replaces the provisional result of a non-terminal root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotARootQuery`] for a child and
    /// [`Error::IllegalStateTransition`] for a terminal root, whose result is fixed.
    pub fn refresh_provisional_result(&mut self, result: ResultContext) -> Result<()> {
        if !self.is_root() {
            return Err(Error::NotARootQuery { query_id: self.id });
        }
        if self.state.is_terminal() {
            return Err(Error::IllegalStateTransition {
                query_id: self.id,
                from: self.state.to_string(),
                to: self.state.to_string(),
                reason: "result context of a terminal root is immutable".to_string(),
            });
        }
        self.result_context = Some(result);
        Ok(())
    }

    #[tracing::instrument(
        skip(self, source, message, at),
        fields(query_id = %self.id, from = %self.state, to = %operation.target_state())
    )]
    fn apply(
        &mut self,
        operation: QueryOperation,
        source: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let target = operation.target_state();
        if !self.state.can_transition_to(target) {
            return Err(Error::IllegalStateTransition {
                query_id: self.id,
                from: self.state.to_string(),
                to: target.to_string(),
                reason: format!(
                    "valid transitions from {}: {:?}",
                    self.state,
                    self.state.valid_transitions()
                ),
            });
        }

        let from = self.state;
        self.state = target;
        self.push_history(source, message, at);
        FederaMetrics::new().record_transition(from.as_label(), target.as_label());
        tracing::info!(source, "query transitioned");
        Ok(())
    }

    fn push_history(&mut self, source: &str, message: &str, at: DateTime<Utc>) {
        let previous = self
            .status_history
            .last()
            .map_or(self.created_at, |entry| entry.timestamp);
        let duration_ms = u64::try_from((at - previous).num_milliseconds()).unwrap_or(0);
        self.status_history.push(StatusEntry {
            source: source.to_string(),
            message: message.to_string(),
            duration_ms,
            timestamp: at,
        });
    }
}
