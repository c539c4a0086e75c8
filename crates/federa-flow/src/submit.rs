//! Submission of federated queries.
//!
//! A [`FederatedQueryRequest`] runs through an ordered list of
//! [`SubmissionStep`]s that share a typed [`SubmissionContext`]:
//!
//! 1. [`ValidateRequest`]: reject malformed requests
//! 2. [`BuildQueryTree`]: create the root and one child per data source
//! 3. [`PersistQueryTree`]: insert the tree into the store
//! 4. [`StartChildren`]: queue, start and dispatch every child
//! 5. [`StartRoot`]: move the root to EXECUTING
//!
//! A child whose dispatch fails is failed on the spot; the root still starts
//! and the quorum rule decides later whether enough sources answered.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use federa_core::{DataSourceId, QueryId};

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::query::QueryContext;
use crate::store::QueryContextStore;

/// Status history source for submission entries.
pub const SUBMITTER_SOURCE: &str = "submitter";

/// A request to run one query against several data sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedQueryRequest {
    /// What to count.
    pub root_entity: String,
    /// Target data sources.
    pub data_sources: Vec<DataSourceId>,
    /// Absolute deadline.
    pub stale_at: DateTime<Utc>,
    /// Completed children required for the root to complete.
    pub min_responding_data_sources: u32,
}

impl FederatedQueryRequest {
    /// Creates a request with no data sources and a quorum of one.
    #[must_use]
    pub fn new(root_entity: impl Into<String>, stale_at: DateTime<Utc>) -> Self {
        Self {
            root_entity: root_entity.into(),
            data_sources: Vec::new(),
            stale_at,
            min_responding_data_sources: 1,
        }
    }

    /// Adds a data source.
    ///
    /// # Errors
    ///
    /// Returns an error if `data_source` is not a valid identifier.
    pub fn with_data_source(mut self, data_source: &str) -> Result<Self> {
        self.data_sources.push(DataSourceId::new(data_source)?);
        Ok(self)
    }

    /// Sets the quorum.
    #[must_use]
    pub const fn with_min_responding(mut self, min_responding: u32) -> Self {
        self.min_responding_data_sources = min_responding;
        self
    }

    /// Checks the request against `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an empty entity, no or duplicate
    /// data sources, a zero quorum, a quorum above the number of sources, or
    /// a deadline that is not in the future.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.root_entity.trim().is_empty() {
            return Err(Error::configuration("root entity cannot be empty"));
        }
        if self.data_sources.is_empty() {
            return Err(Error::configuration("at least one data source is required"));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.data_sources.iter().find(|ds| !seen.insert(*ds)) {
            return Err(Error::configuration(format!("duplicate data source '{dup}'")));
        }

        if self.min_responding_data_sources == 0 {
            return Err(Error::configuration(
                "min responding data sources must be at least 1",
            ));
        }
        let sources = self.data_sources.len();
        if usize::try_from(self.min_responding_data_sources).unwrap_or(usize::MAX) > sources {
            return Err(Error::configuration(format!(
                "min responding data sources ({}) exceeds number of data sources ({sources})",
                self.min_responding_data_sources
            )));
        }

        if self.stale_at <= now {
            return Err(Error::configuration(format!(
                "deadline {} is not after submission time {now}",
                self.stale_at
            )));
        }
        Ok(())
    }
}

/// State shared by the submission steps.
#[derive(Debug, Clone)]
pub struct SubmissionContext {
    /// The request being submitted.
    pub request: FederatedQueryRequest,
    /// Submission time.
    pub now: DateTime<Utc>,
    /// The root, once built.
    pub root: Option<QueryContext>,
    /// The children, once built, in request order.
    pub children: Vec<QueryContext>,
    /// Data sources whose dispatch failed.
    pub failed_to_start: Vec<DataSourceId>,
}

impl SubmissionContext {
    /// Creates a context for `request`.
    #[must_use]
    pub const fn new(request: FederatedQueryRequest, now: DateTime<Utc>) -> Self {
        Self {
            request,
            now,
            root: None,
            children: Vec::new(),
            failed_to_start: Vec::new(),
        }
    }

    /// The root query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`] with an internal error if no step built the tree yet.
    pub fn root(&self) -> Result<&QueryContext> {
        self.root.as_ref().ok_or_else(missing_root)
    }

    fn root_mut(&mut self) -> Result<&mut QueryContext> {
        self.root.as_mut().ok_or_else(missing_root)
    }
}

fn missing_root() -> Error {
    federa_core::Error::internal("submission step ran before the query tree was built").into()
}

/// One stage of the submission pipeline.
#[async_trait]
pub trait SubmissionStep: Send + Sync {
    /// Step name for logs.
    fn name(&self) -> &'static str;

    /// Runs the step.
    async fn run(&self, ctx: &mut SubmissionContext) -> Result<()>;
}

/// Rejects malformed requests.
#[derive(Debug, Default)]
pub struct ValidateRequest;

#[async_trait]
impl SubmissionStep for ValidateRequest {
    fn name(&self) -> &'static str {
        "validate_request"
    }

    async fn run(&self, ctx: &mut SubmissionContext) -> Result<()> {
        ctx.request.validate(ctx.now)
    }
}

/// Builds the root and its children in SUBMITTED state.
#[derive(Debug, Default)]
pub struct BuildQueryTree;

#[async_trait]
impl SubmissionStep for BuildQueryTree {
    fn name(&self) -> &'static str {
        "build_query_tree"
    }

    async fn run(&self, ctx: &mut SubmissionContext) -> Result<()> {
        let root = QueryContext::new_root(
            ctx.request.root_entity.clone(),
            ctx.request.stale_at,
            ctx.request.min_responding_data_sources,
            ctx.now,
        );
        ctx.children = ctx
            .request
            .data_sources
            .iter()
            .map(|ds| QueryContext::new_child(&root, ds.clone(), ctx.now))
            .collect::<Result<_>>()?;
        ctx.root = Some(root);
        Ok(())
    }
}

/// Inserts the root, then every child.
pub struct PersistQueryTree {
    store: Arc<dyn QueryContextStore>,
}

impl PersistQueryTree {
    /// Creates the step.
    #[must_use]
    pub fn new(store: Arc<dyn QueryContextStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SubmissionStep for PersistQueryTree {
    fn name(&self) -> &'static str {
        "persist_query_tree"
    }

    async fn run(&self, ctx: &mut SubmissionContext) -> Result<()> {
        self.store.insert(ctx.root()?).await?;
        for child in &ctx.children {
            self.store.insert(child).await?;
        }
        Ok(())
    }
}

/// Queues, starts and dispatches every child.
pub struct StartChildren {
    store: Arc<dyn QueryContextStore>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl StartChildren {
    /// Creates the step.
    #[must_use]
    pub fn new(store: Arc<dyn QueryContextStore>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { store, dispatcher }
    }
}

#[async_trait]
impl SubmissionStep for StartChildren {
    fn name(&self) -> &'static str {
        "start_children"
    }

    async fn run(&self, ctx: &mut SubmissionContext) -> Result<()> {
        let now = ctx.now;
        for child in &mut ctx.children {
            child.queue(SUBMITTER_SOURCE, now)?;
            child.start(SUBMITTER_SOURCE, now)?;
            self.store.update_checked(child).await?;

            if let Err(e) = self.dispatcher.start_query(child).await {
                tracing::warn!(
                    query_id = %child.id(),
                    data_source = ?child.data_source_id(),
                    error = %e,
                    "dispatch failed; failing child"
                );
                child.fail(SUBMITTER_SOURCE, &format!("dispatch failed: {e}"), now)?;
                self.store.update_checked(child).await?;
                if let Some(ds) = child.data_source_id() {
                    ctx.failed_to_start.push(ds.clone());
                }
            }
        }
        Ok(())
    }
}

/// Moves the root to EXECUTING.
pub struct StartRoot {
    store: Arc<dyn QueryContextStore>,
}

impl StartRoot {
    /// Creates the step.
    #[must_use]
    pub fn new(store: Arc<dyn QueryContextStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SubmissionStep for StartRoot {
    fn name(&self) -> &'static str {
        "start_root"
    }

    async fn run(&self, ctx: &mut SubmissionContext) -> Result<()> {
        let now = ctx.now;
        let root = ctx.root_mut()?;
        root.queue(SUBMITTER_SOURCE, now)?;
        root.start(SUBMITTER_SOURCE, now)?;
        self.store.update_checked(root).await
    }
}

/// Runs the submission pipeline.
pub struct QuerySubmitter {
    steps: Vec<Box<dyn SubmissionStep>>,
}

impl std::fmt::Debug for QuerySubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySubmitter")
            .field("steps", &self.step_names())
            .finish()
    }
}

impl QuerySubmitter {
    /// Creates a submitter with the standard pipeline.
    #[must_use]
    pub fn new(store: Arc<dyn QueryContextStore>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self::with_steps(vec![
            Box::new(ValidateRequest),
            Box::new(BuildQueryTree),
            Box::new(PersistQueryTree::new(Arc::clone(&store))),
            Box::new(StartChildren::new(Arc::clone(&store), dispatcher)),
            Box::new(StartRoot::new(store)),
        ])
    }

    /// Creates a submitter with a custom pipeline.
    #[must_use]
    pub fn with_steps(steps: Vec<Box<dyn SubmissionStep>>) -> Self {
        Self { steps }
    }

    /// Names of the steps, in order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Submits a request and returns the root query ID.
    ///
    /// # Errors
    ///
    /// Returns the first step error. Validation errors are
    /// [`Error::Configuration`].
    pub async fn submit(&self, request: FederatedQueryRequest, now: DateTime<Utc>) -> Result<QueryId> {
        let ctx = self.submit_with_context(request, now).await?;
        Ok(ctx.root()?.id())
    }

    /// Submits a request and returns the final pipeline context.
    ///
    /// # Errors
    ///
    /// Returns the first step error.
    #[tracing::instrument(
        skip(self, request),
        fields(root_entity = %request.root_entity, data_sources = request.data_sources.len())
    )]
    pub async fn submit_with_context(
        &self,
        request: FederatedQueryRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmissionContext> {
        let mut ctx = SubmissionContext::new(request, now);
        for step in &self.steps {
            step.run(&mut ctx).await.inspect_err(|e| {
                tracing::warn!(step = step.name(), error = %e, "submission step failed");
            })?;
            tracing::debug!(step = step.name(), "submission step complete");
        }
        if let Some(root) = &ctx.root {
            tracing::info!(
                query_id = %root.id(),
                failed_to_start = ctx.failed_to_start.len(),
                "federated query submitted"
            );
        }
        Ok(ctx)
    }
}
