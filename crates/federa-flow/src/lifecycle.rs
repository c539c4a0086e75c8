//! Data source callbacks and cancellation.
//!
//! These handlers are transport-agnostic: an adapter parses whatever its data
//! source sends and calls them with typed arguments.
//!
//! Every write is a compare-and-set. A conflict on the query being changed is
//! returned as [`Error::ConcurrentModification`]; nothing here retries.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use federa_core::QueryId;

use crate::aggregate::AggregationEngine;
use crate::config::AggregationConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::query::{QueryContext, QueryState, ResultContext};
use crate::store::QueryContextStore;

/// Status history source for cancellation entries.
pub const CANCEL_SOURCE: &str = "cancel";

/// Applies data source callbacks and cancellations to query trees.
pub struct QueryLifecycle {
    store: Arc<dyn QueryContextStore>,
    dispatcher: Arc<dyn Dispatcher>,
    engine: AggregationEngine,
}

impl std::fmt::Debug for QueryLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryLifecycle")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl QueryLifecycle {
    /// Creates a lifecycle handler.
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
        })
    }

    /// Records that a child's data source finished.
    ///
    /// `None` means the source reported success without a result; the child
    /// completes and aggregation treats it as partial data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueryNotFound`], [`Error::NotAChildQuery`],
    /// [`Error::IllegalStateTransition`] unless the child is EXECUTING, or
    /// [`Error::ConcurrentModification`].
    #[tracing::instrument(skip(self, result), fields(query_id = %child_id))]
    pub async fn complete_child(
        &self,
        child_id: QueryId,
        result: Option<ResultContext>,
        now: DateTime<Utc>,
    ) -> Result<QueryContext> {
        let mut child = self.load_child(child_id).await?;
        let source = source_of(&child);
        match result {
            Some(rc) => child.finish(&source, rc, now)?,
            None => child.finish_without_result(&source, now)?,
        }
        self.commit_child(&mut child).await?;
        Ok(child)
    }

    /// Records that a child's data source failed.
    ///
    /// # Errors
    ///
    /// Same as [`complete_child`](Self::complete_child), except that a STOPPED
    /// child may also fail.
    #[tracing::instrument(skip(self, reason), fields(query_id = %child_id))]
    pub async fn fail_child(
        &self,
        child_id: QueryId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<QueryContext> {
        let mut child = self.load_child(child_id).await?;
        let source = source_of(&child);
        child.fail(&source, reason, now)?;
        self.commit_child(&mut child).await?;
        Ok(child)
    }

    /// Stops a root and every EXECUTING child, signalling each to the dispatcher.
    ///
    /// Stopped queries are failed by the sealer once their deadline passes.
    /// Stop signals are best effort. Returns the IDs stopped, root first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotARootQuery`] for a child,
    /// [`Error::IllegalStateTransition`] unless the root is EXECUTING, or a
    /// store error.
    #[tracing::instrument(skip(self, reason), fields(query_id = %root_id))]
    pub async fn cancel(
        &self,
        root_id: QueryId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueryId>> {
        let mut root = self.store.load(&root_id).await?;
        if !root.is_root() {
            return Err(Error::NotARootQuery { query_id: root_id });
        }

        root.stop(CANCEL_SOURCE, reason, now)?;
        self.store.update_checked(&mut root).await?;
        self.signal_stop(&root).await;
        let mut stopped = vec![root_id];

        let executing = self
            .store
            .find_children_by_state(&root_id, QueryState::Executing)
            .await?;
        for mut child in executing {
            child.stop(CANCEL_SOURCE, reason, now)?;
            self.store.update_checked(&mut child).await?;
            self.signal_stop(&child).await;
            stopped.push(child.id());
        }

        tracing::info!(stopped = stopped.len(), "query tree cancelled");
        Ok(stopped)
    }

    async fn load_child(&self, child_id: QueryId) -> Result<QueryContext> {
        let child = self.store.load(&child_id).await?;
        if child.is_root() {
            return Err(Error::NotAChildQuery { query_id: child_id });
        }
        Ok(child)
    }

    /// Persists the child, then refreshes its root's provisional result.
    ///
    /// The child write is authoritative. A conflict while refreshing the root
    /// is only logged, since the next refresh re-derives the same value.
    async fn commit_child(&self, child: &mut QueryContext) -> Result<()> {
        self.store.update_checked(child).await?;
        match self.engine.update_parent_state(child).await {
            Err(Error::ConcurrentModification { query_id, .. }) => {
                tracing::warn!(root_id = %query_id, "root changed concurrently; provisional result not refreshed");
                Ok(())
            }
            other => other,
        }
    }

    async fn signal_stop(&self, query: &QueryContext) {
        if let Err(e) = self.dispatcher.stop_query(query).await {
            tracing::warn!(query_id = %query.id(), error = %e, "stop signal failed");
        }
    }
}

fn source_of(child: &QueryContext) -> String {
    child
        .data_source_id()
        .map_or_else(|| "unknown".to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::memory::RecordingDispatcher;
    use crate::store::memory::InMemoryQueryStore;
    use crate::submit::{FederatedQueryRequest, QuerySubmitter};
    use chrono::Duration;

    struct Fixture {
        store: Arc<InMemoryQueryStore>,
        dispatcher: Arc<RecordingDispatcher>,
        lifecycle: QueryLifecycle,
        root_id: QueryId,
        children: Vec<QueryContext>,
    }

    async fn fixture(now: DateTime<Utc>) -> Result<Fixture> {
        let store = Arc::new(InMemoryQueryStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let request = FederatedQueryRequest::new("Patient", now + Duration::minutes(10))
            .with_data_source("site-a")?
            .with_data_source("site-b")?
            .with_min_responding(1);
        let root_id = QuerySubmitter::new(store.clone(), dispatcher.clone())
            .submit(request, now)
            .await?;
        let children = store.find_children(&root_id).await?;
        let lifecycle = QueryLifecycle::new(
            store.clone(),
            dispatcher.clone(),
            AggregationConfig::default(),
        )?;
        Ok(Fixture {
            store,
            dispatcher,
            lifecycle,
            root_id,
            children,
        })
    }

    #[tokio::test]
    async fn completing_children_refreshes_root_count() -> Result<()> {
        let now = Utc::now();
        let f = fixture(now).await?;

        f.lifecycle
            .complete_child(f.children[0].id(), Some(ResultContext::count_only("Patient", 30)), now)
            .await?;
        f.lifecycle
            .complete_child(f.children[1].id(), Some(ResultContext::count_only("Patient", 12)), now)
            .await?;

        let root = f.store.load(&f.root_id).await?;
        assert_eq!(root.state(), QueryState::Executing);
        assert_eq!(root.num_records(), 42);
        Ok(())
    }

    #[tokio::test]
    async fn failed_child_contributes_nothing() -> Result<()> {
        let now = Utc::now();
        let f = fixture(now).await?;

        f.lifecycle
            .complete_child(f.children[0].id(), Some(ResultContext::count_only("Patient", 7)), now)
            .await?;
        let failed = f
            .lifecycle
            .fail_child(f.children[1].id(), "timeout", now)
            .await?;

        assert_eq!(failed.state(), QueryState::Failed);
        assert_eq!(f.store.load(&f.root_id).await?.num_records(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn callbacks_reject_roots_and_double_completion() -> Result<()> {
        let now = Utc::now();
        let f = fixture(now).await?;

        assert!(matches!(
            f.lifecycle.fail_child(f.root_id, "x", now).await,
            Err(Error::NotAChildQuery { .. })
        ));

        f.lifecycle
            .complete_child(f.children[0].id(), None, now)
            .await?;
        assert!(matches!(
            f.lifecycle.complete_child(f.children[0].id(), None, now).await,
            Err(Error::IllegalStateTransition { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn stale_copy_surfaces_concurrent_modification() -> Result<()> {
        let now = Utc::now();
        let f = fixture(now).await?;
        let mut stale_copy = f.store.load(&f.children[0].id()).await?;

        f.lifecycle
            .complete_child(f.children[0].id(), None, now)
            .await?;
        stale_copy.fail("site-a", "late", now)?;

        assert!(matches!(
            f.store.update_checked(&mut stale_copy).await,
            Err(Error::ConcurrentModification { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn cancel_stops_root_and_executing_children() -> Result<()> {
        let now = Utc::now();
        let f = fixture(now).await?;
        f.lifecycle
            .complete_child(f.children[0].id(), None, now)
            .await?;
        f.dispatcher.clear()?;

        let stopped = f.lifecycle.cancel(f.root_id, "user request", now).await?;

        assert_eq!(stopped, vec![f.root_id, f.children[1].id()]);
        assert_eq!(f.store.load(&f.root_id).await?.state(), QueryState::Stopped);
        assert_eq!(
            f.store.load(&f.children[0].id()).await?.state(),
            QueryState::Completed
        );
        assert_eq!(f.dispatcher.count("stop")?, 2);
        Ok(())
    }
}
