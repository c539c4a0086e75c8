//! Pluggable storage for query contexts.
//!
//! The [`QueryContextStore`] trait is the persistence seam of the engine.
//! The sealer, aggregation engine, submitter and lifecycle callbacks all
//! read and write query trees through it.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: Updates compare the caller's version with the stored one
//! - **Deterministic finders**: Results come back in a stable order
//! - **Testability**: In-memory implementation for tests and replay tooling

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use federa_core::QueryId;

use crate::error::{Error, Result};
use crate::query::{QueryContext, QueryState};

/// Result of a compare-and-swap update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Update applied.
    Success,
    /// Query not found.
    NotFound,
    /// Version conflict (concurrent modification).
    VersionConflict {
        /// The version currently stored.
        actual: u64,
    },
}

impl CasResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the query was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Storage abstraction for query trees.
///
/// ## CAS Semantics
///
/// [`update`](Self::update) succeeds only when the stored version equals the
/// version carried by the caller's copy. On success the stored version is
/// incremented and written back into the caller's copy.
///
/// ## Finder Ordering
///
/// - [`find_stale_queries`](Self::find_stale_queries) returns children before
///   roots, each group ordered by deadline then ID.
/// - Child finders return children ordered by data source ID, then query ID.
#[async_trait]
pub trait QueryContextStore: Send + Sync {
    /// Inserts a new query context.
    ///
    /// # Errors
    ///
    /// Fails if the ID already exists, or with [`Error::NestedChildQuery`] if
    /// the parent is itself a child.
    async fn insert(&self, query: &QueryContext) -> Result<()>;

    /// Gets a query by ID.
    ///
    /// Returns `None` if the query does not exist.
    async fn get(&self, id: &QueryId) -> Result<Option<QueryContext>>;

    /// Atomically replaces a query if its version is unchanged.
    async fn update(&self, query: &mut QueryContext) -> Result<CasResult>;

    /// Queries whose deadline has passed and that still need sealing.
    ///
    /// Matches `stale_at <= now`, not yet stale, state neither COMPLETED nor FAILED.
    async fn find_stale_queries(&self, now: DateTime<Utc>) -> Result<Vec<QueryContext>>;

    /// EXECUTING roots whose children have all reported before the deadline.
    ///
    /// Matches roots that are not stale, with `stale_at > now`, at least one
    /// child, and every child COMPLETED or FAILED.
    async fn find_executing_not_stale_queries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueryContext>>;

    /// All children of `parent`.
    async fn find_children(&self, parent: &QueryId) -> Result<Vec<QueryContext>>;

    /// Children of `parent` in the given state.
    async fn find_children_by_state(
        &self,
        parent: &QueryId,
        state: QueryState,
    ) -> Result<Vec<QueryContext>> {
        let children = self.find_children(parent).await?;
        Ok(children.into_iter().filter(|c| c.state() == state).collect())
    }

    /// COMPLETED children of `parent`.
    async fn find_completed_children(&self, parent: &QueryId) -> Result<Vec<QueryContext>> {
        self.find_children_by_state(parent, QueryState::Completed)
            .await
    }

    /// FAILED children of `parent`.
    async fn find_failed_children(&self, parent: &QueryId) -> Result<Vec<QueryContext>> {
        self.find_children_by_state(parent, QueryState::Failed).await
    }

    /// Gets a query by ID, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueryNotFound`] if the query does not exist.
    async fn load(&self, id: &QueryId) -> Result<QueryContext> {
        self.get(id)
            .await?
            .ok_or(Error::QueryNotFound { query_id: *id })
    }

    /// Updates a query, turning a failed compare-and-set into an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrentModification`] on a version conflict and
    /// [`Error::QueryNotFound`] if the query disappeared.
    async fn update_checked(&self, query: &mut QueryContext) -> Result<()> {
        let expected_version = query.version();
        match self.update(query).await? {
            CasResult::Success => Ok(()),
            CasResult::NotFound => Err(Error::QueryNotFound {
                query_id: query.id(),
            }),
            CasResult::VersionConflict { .. } => Err(Error::ConcurrentModification {
                query_id: query.id(),
                expected_version,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_predicates() {
        assert!(CasResult::Success.is_success());
        assert!(!CasResult::NotFound.is_success());
        assert!(!CasResult::VersionConflict { actual: 3 }.is_success());
        assert!(CasResult::NotFound.is_not_found());
    }
}
