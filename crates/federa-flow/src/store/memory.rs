//! In-memory query store for testing and replay tooling.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: State is not shared across process boundaries

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use federa_core::QueryId;

use super::{CasResult, QueryContextStore};
use crate::error::{Error, Result};
use crate::query::{QueryContext, QueryState};

/// In-memory query store.
///
/// Every mutation happens under a single `RwLock` write guard, which makes
/// [`update`](QueryContextStore::update) an atomic compare-and-set.
///
/// ## Example
///
/// ```rust
/// use federa_flow::store::memory::InMemoryQueryStore;
///
/// let store = InMemoryQueryStore::new();
/// assert_eq!(store.len().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryQueryStore {
    queries: RwLock<HashMap<QueryId, QueryContext>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

fn deterministic_child_order(a: &QueryContext, b: &QueryContext) -> std::cmp::Ordering {
    a.data_source_id()
        .cmp(&b.data_source_id())
        .then_with(|| a.id().cmp(&b.id()))
}

impl InMemoryQueryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated from a snapshot.
    ///
    /// Roots are inserted before children so nesting checks see every parent.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot contains duplicate IDs or nested children.
    pub fn from_snapshot(mut queries: Vec<QueryContext>) -> Result<Self> {
        queries.sort_by_key(|q| !q.is_root());
        let store = Self::new();
        {
            let mut map = store.queries.write().map_err(poison_err)?;
            for query in queries {
                Self::check_insert(&map, &query)?;
                map.insert(query.id(), query);
            }
        }
        Ok(store)
    }

    /// Returns the number of stored queries.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let count = {
            let queries = self.queries.read().map_err(poison_err)?;
            queries.len()
        };
        Ok(count)
    }

    /// Returns true if the store is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns every stored query, roots first, then ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<QueryContext>> {
        let mut all: Vec<QueryContext> = {
            let queries = self.queries.read().map_err(poison_err)?;
            queries.values().cloned().collect()
        };
        all.sort_by(|a, b| {
            (!a.is_root())
                .cmp(&!b.is_root())
                .then_with(|| a.id().cmp(&b.id()))
        });
        Ok(all)
    }

    fn check_insert(map: &HashMap<QueryId, QueryContext>, query: &QueryContext) -> Result<()> {
        if map.contains_key(&query.id()) {
            return Err(Error::storage(format!(
                "query {} already exists",
                query.id()
            )));
        }
        if let Some(parent) = query.parent_id().and_then(|p| map.get(&p)) {
            if !parent.is_root() {
                return Err(Error::NestedChildQuery {
                    query_id: query.id(),
                    parent_id: parent.id(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueryContextStore for InMemoryQueryStore {
    async fn insert(&self, query: &QueryContext) -> Result<()> {
        let mut queries = self.queries.write().map_err(poison_err)?;
        Self::check_insert(&queries, query)?;
        queries.insert(query.id(), query.clone());
        drop(queries);
        Ok(())
    }

    async fn get(&self, id: &QueryId) -> Result<Option<QueryContext>> {
        let result = {
            let queries = self.queries.read().map_err(poison_err)?;
            queries.get(id).cloned()
        };
        Ok(result)
    }

    async fn update(&self, query: &mut QueryContext) -> Result<CasResult> {
        let mut queries = self.queries.write().map_err(poison_err)?;

        let Some(stored) = queries.get_mut(&query.id()) else {
            drop(queries);
            return Ok(CasResult::NotFound);
        };

        if stored.version() != query.version() {
            let actual = stored.version();
            drop(queries);
            return Ok(CasResult::VersionConflict { actual });
        }

        query.set_stored_version(query.version() + 1);
        *stored = query.clone();
        drop(queries);
        Ok(CasResult::Success)
    }

    async fn find_stale_queries(&self, now: DateTime<Utc>) -> Result<Vec<QueryContext>> {
        let mut result: Vec<QueryContext> = {
            let queries = self.queries.read().map_err(poison_err)?;
            queries
                .values()
                .filter(|q| {
                    q.stale_at() <= now
                        && !q.is_stale()
                        && !matches!(q.state(), QueryState::Completed | QueryState::Failed)
                })
                .cloned()
                .collect()
        };

        result.sort_by(|a, b| {
            a.is_root()
                .cmp(&b.is_root())
                .then_with(|| a.stale_at().cmp(&b.stale_at()))
                .then_with(|| a.id().cmp(&b.id()))
        });
        Ok(result)
    }

    async fn find_executing_not_stale_queries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueryContext>> {
        let queries = self.queries.read().map_err(poison_err)?;

        let mut tallies: HashMap<QueryId, (usize, usize)> = HashMap::new();
        for child in queries.values() {
            if let Some(parent) = child.parent_id() {
                let entry = tallies.entry(parent).or_default();
                entry.0 += 1;
                if child.is_terminal() {
                    entry.1 += 1;
                }
            }
        }

        let mut result: Vec<QueryContext> = queries
            .values()
            .filter(|q| {
                q.is_root()
                    && q.state() == QueryState::Executing
                    && !q.is_stale()
                    && q.stale_at() > now
                    && tallies
                        .get(&q.id())
                        .is_some_and(|(total, resolved)| *total > 0 && total == resolved)
            })
            .cloned()
            .collect();
        drop(queries);

        result.sort_by_key(QueryContext::id);
        Ok(result)
    }

    async fn find_children(&self, parent: &QueryId) -> Result<Vec<QueryContext>> {
        let mut children: Vec<QueryContext> = {
            let queries = self.queries.read().map_err(poison_err)?;
            queries
                .values()
                .filter(|q| q.parent_id() == Some(*parent))
                .cloned()
                .collect()
        };
        children.sort_by(deterministic_child_order);
        Ok(children)
    }
}
