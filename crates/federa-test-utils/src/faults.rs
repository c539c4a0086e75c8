//! Failure injection wrappers.
//!
//! Both wrappers delegate to the in-memory implementations and fail only for
//! the query IDs a test registers, which makes per-query isolation testable.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use federa_core::QueryId;
use federa_flow::aggregate::FederatedResult;
use federa_flow::dispatch::Dispatcher;
use federa_flow::dispatch::memory::RecordingDispatcher;
use federa_flow::error::{Error, Result};
use federa_flow::query::QueryContext;
use federa_flow::store::memory::InMemoryQueryStore;
use federa_flow::store::{CasResult, QueryContextStore};

/// Dispatcher that fails selected signals and records the rest.
#[derive(Debug, Default)]
pub struct FaultyDispatcher {
    inner: RecordingDispatcher,
    fail_start: Mutex<HashSet<QueryId>>,
    fail_start_sources: Mutex<HashSet<String>>,
    fail_stop: Mutex<HashSet<QueryId>>,
    fail_publish: Mutex<HashSet<QueryId>>,
}

impl FaultyDispatcher {
    /// Creates a dispatcher with no injected failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The recording dispatcher behind the wrapper.
    pub fn recorded(&self) -> &RecordingDispatcher {
        &self.inner
    }

    /// Fails `start_query` for `id`.
    pub fn fail_start_for(&self, id: QueryId) {
        self.fail_start.lock().expect("lock").insert(id);
    }

    /// Fails `start_query` for any child targeting `data_source`.
    pub fn fail_start_for_source(&self, data_source: &str) {
        self.fail_start_sources
            .lock()
            .expect("lock")
            .insert(data_source.to_string());
    }

    /// Fails `stop_query` for `id`.
    pub fn fail_stop_for(&self, id: QueryId) {
        self.fail_stop.lock().expect("lock").insert(id);
    }

    /// Fails `publish_federated_result` for root `id`.
    pub fn fail_publish_for(&self, id: QueryId) {
        self.fail_publish.lock().expect("lock").insert(id);
    }

    fn check(set: &Mutex<HashSet<QueryId>>, id: QueryId, signal: &str) -> Result<()> {
        if set.lock().expect("lock").contains(&id) {
            return Err(Error::dispatch(format!("injected {signal} failure for {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for FaultyDispatcher {
    async fn start_query(&self, query: &QueryContext) -> Result<()> {
        Self::check(&self.fail_start, query.id(), "start")?;
        if let Some(ds) = query.data_source_id() {
            if self.fail_start_sources.lock().expect("lock").contains(ds.as_str()) {
                return Err(Error::dispatch(format!("injected start failure for source {ds}")));
            }
        }
        self.inner.start_query(query).await
    }

    async fn stop_query(&self, query: &QueryContext) -> Result<()> {
        Self::check(&self.fail_stop, query.id(), "stop")?;
        self.inner.stop_query(query).await
    }

    async fn publish_federated_result(
        &self,
        root: &QueryContext,
        result: &FederatedResult,
    ) -> Result<()> {
        Self::check(&self.fail_publish, root.id(), "publish")?;
        self.inner.publish_federated_result(root, result).await
    }
}

/// Store that fails or conflicts on updates of selected queries.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: Arc<InMemoryQueryStore>,
    fail_update: Mutex<HashSet<QueryId>>,
    conflict_update: Mutex<HashSet<QueryId>>,
    fail_finders: Mutex<bool>,
}

impl FaultyStore {
    /// Wraps an existing store.
    #[must_use]
    pub fn wrap(inner: Arc<InMemoryQueryStore>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<InMemoryQueryStore> {
        &self.inner
    }

    /// Makes `update` return a storage error for `id`.
    pub fn fail_update_for(&self, id: QueryId) {
        self.fail_update.lock().expect("lock").insert(id);
    }

    /// Makes `update` report a version conflict for `id`.
    pub fn conflict_update_for(&self, id: QueryId) {
        self.conflict_update.lock().expect("lock").insert(id);
    }

    /// Makes both sealer finders fail.
    pub fn fail_finders(&self) {
        *self.fail_finders.lock().expect("lock") = true;
    }

    fn check_finders(&self) -> Result<()> {
        if *self.fail_finders.lock().expect("lock") {
            return Err(Error::storage("injected finder failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl QueryContextStore for FaultyStore {
    async fn insert(&self, query: &QueryContext) -> Result<()> {
        self.inner.insert(query).await
    }

    async fn get(&self, id: &QueryId) -> Result<Option<QueryContext>> {
        self.inner.get(id).await
    }

    async fn update(&self, query: &mut QueryContext) -> Result<CasResult> {
        let id = query.id();
        if self.fail_update.lock().expect("lock").contains(&id) {
            return Err(Error::storage(format!("injected update failure for {id}")));
        }
        if self.conflict_update.lock().expect("lock").contains(&id) {
            return Ok(CasResult::VersionConflict {
                actual: query.version() + 1,
            });
        }
        self.inner.update(query).await
    }

    async fn find_stale_queries(&self, now: DateTime<Utc>) -> Result<Vec<QueryContext>> {
        self.check_finders()?;
        self.inner.find_stale_queries(now).await
    }

    async fn find_executing_not_stale_queries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueryContext>> {
        self.check_finders()?;
        self.inner.find_executing_not_stale_queries(now).await
    }

    async fn find_children(&self, parent: &QueryId) -> Result<Vec<QueryContext>> {
        self.inner.find_children(parent).await
    }
}
