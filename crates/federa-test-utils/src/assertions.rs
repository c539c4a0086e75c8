//! Custom assertion helpers for integration tests.

use federa_core::QueryId;
use federa_flow::aggregate::{Cell, FederatedResult};
use federa_flow::dispatch::memory::RecordingDispatcher;
use federa_flow::query::{QueryContext, QueryState};
use federa_flow::sealer::{Disposition, SealReport};

/// Asserts that a query was sealed into `state` and marked stale.
///
/// # Panics
///
/// Panics if the state differs or the query is not stale.
pub fn assert_sealed_stale(query: &QueryContext, state: QueryState) {
    assert_eq!(
        query.state(),
        state,
        "Expected {} to be {state}, but state was {}",
        query.id(),
        query.state()
    );
    assert!(query.is_stale(), "Expected {} to be marked stale", query.id());
}

/// Asserts that the status history is ordered and has plausible durations.
///
/// # Panics
///
/// Panics if timestamps go backwards.
pub fn assert_history_ordered(query: &QueryContext) {
    let history = query.status_history();
    for pair in history.windows(2) {
        assert!(
            pair[0].timestamp <= pair[1].timestamp,
            "History of {} goes backwards: {:?} then {:?}",
            query.id(),
            pair[0],
            pair[1]
        );
    }
}

/// Asserts that exactly one result was published for `root_id`.
///
/// # Panics
///
/// Panics unless there is exactly one publication for the root.
pub fn assert_published_once(dispatcher: &RecordingDispatcher, root_id: QueryId) -> FederatedResult {
    let matching: Vec<FederatedResult> = dispatcher
        .publications()
        .expect("publications")
        .into_iter()
        .filter(|p| p.query_id == root_id)
        .collect();
    assert_eq!(
        matching.len(),
        1,
        "Expected exactly one publication for {root_id}, found {}",
        matching.len()
    );
    matching.into_iter().next().expect("one publication")
}

/// Asserts that no visible cell, view count or total lies strictly between zero and `boundary`.
///
/// # Panics
///
/// Panics on the first small count found.
pub fn assert_no_small_counts(result: &FederatedResult, boundary: u64) {
    let cells = result
        .results
        .values()
        .flatten()
        .flat_map(|category| category.counts.values())
        .chain(result.view_counts.values())
        .chain(std::iter::once(&result.num_records));
    for cell in cells {
        if let Cell::Count(n) = cell {
            assert!(
                *n == 0 || *n >= boundary,
                "Visible count {n} is below mask boundary {boundary}"
            );
        }
    }
}

/// Asserts that a report contains no errored or conflicting outcomes.
///
/// # Panics
///
/// Panics if any outcome errored or conflicted, or the pass had errors.
pub fn assert_report_clean(report: &SealReport) {
    assert!(report.errors.is_empty(), "Pass errors: {:?}", report.errors);
    for outcome in &report.outcomes {
        assert!(
            !matches!(
                outcome.disposition,
                Disposition::Errored { .. } | Disposition::Conflict { .. }
            ),
            "Query {} did not seal cleanly: {:?}",
            outcome.query_id,
            outcome.disposition
        );
    }
}
