//! Property-based tests for federa-flow invariants.
//!
//! These tests use proptest to verify invariants hold across
//! randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use tokio_test::block_on;

use federa_flow::aggregate::{AggregatedResults, Category, Cell, MaskPolicy, ResultViewKey};
use federa_flow::query::{QueryContext, QueryOperation, QueryState};
use federa_flow::store::QueryContextStore;
use federa_test_utils::{ChildOutcome, QueryTreeFactory, TestContext};

fn arb_operation() -> impl Strategy<Value = QueryOperation> {
    prop::sample::select(QueryOperation::ALL.to_vec())
}

/// Generates a category with up to eight labelled counts.
fn arb_category() -> impl Strategy<Value = Category> {
    prop::collection::btree_map("[A-Z]{1,6}", 0u64..20, 0..8).prop_map(|counts| {
        counts
            .into_iter()
            .fold(Category::new("c"), |category, (label, n)| {
                category.with_count(label, n)
            })
    })
}

proptest! {
    /// INVARIANT: An operation succeeds exactly when the transition table allows it,
    /// and a rejected operation leaves the context untouched.
    #[test]
    fn operations_follow_transition_table(ops in prop::collection::vec(arb_operation(), 0..12)) {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut qc = QueryContext::new_root("Patient", now + Duration::minutes(5), 1, now);
        let mut applied = 0usize;

        for op in ops {
            let before = qc.clone();
            let allowed = before.state().can_transition_to(op.target_state());
            let result = qc.apply_operation(op, "prop", now);

            prop_assert_eq!(result.is_ok(), allowed);
            if allowed {
                applied += 1;
                prop_assert_eq!(qc.state(), op.target_state());
            } else {
                prop_assert_eq!(&qc, &before);
            }
            if before.state().is_terminal() {
                prop_assert_eq!(&qc, &before);
            }
        }

        prop_assert_eq!(qc.status_history().len(), applied);
    }

    /// INVARIANT: After scrubbing, no visible count lies strictly between zero and the boundary,
    /// and every other count is unchanged.
    #[test]
    fn scrub_hides_exactly_the_small_counts(
        categories in prop::collection::vec(arb_category(), 0..4),
        boundary in 1u64..12,
    ) {
        let policy = MaskPolicy::new(boundary);
        let mut results = AggregatedResults::new();
        results.insert(ResultViewKey::Union, categories.clone());
        let small = categories
            .iter()
            .flat_map(|c| c.counts.values())
            .filter(|cell| matches!(cell, Cell::Count(n) if *n > 0 && *n < boundary))
            .count();

        let masked = policy.scrub(&mut results);

        prop_assert_eq!(masked, small);
        for (original, scrubbed) in categories.iter().zip(&results[&ResultViewKey::Union]) {
            for (label, cell) in &original.counts {
                let after = scrubbed.get(label).unwrap();
                match cell {
                    Cell::Count(n) if *n > 0 && *n < boundary => prop_assert_eq!(after, Cell::Masked),
                    other => prop_assert_eq!(after, *other),
                }
            }
        }
        // Scrubbing twice masks nothing new.
        prop_assert_eq!(policy.scrub(&mut results), 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// INVARIANT: A stale root completes iff at least `quorum` children completed,
    /// and a second pass changes nothing.
    #[test]
    fn quorum_decides_stale_roots(
        completed in prop::collection::vec(any::<bool>(), 1..6),
        quorum_seed in any::<u32>(),
    ) {
        let n = u32::try_from(completed.len()).unwrap();
        let quorum = quorum_seed % n + 1;
        let completed_count = completed.iter().filter(|c| **c).count();

        let (root, first_snapshot, second) = block_on(async {
            let ctx = TestContext::new();
            let mut factory = QueryTreeFactory::new(&ctx).min_responding(quorum);
            for (i, ok) in completed.iter().enumerate() {
                let outcome = if *ok { ChildOutcome::Completed(10) } else { ChildOutcome::Failed };
                factory = factory.child(&format!("site-{i}"), outcome);
            }
            let tree = factory.build().await;
            let sealer = ctx.sealer();

            sealer.run_once(ctx.after_deadline()).await;
            let first_snapshot = ctx.store.snapshot().unwrap();
            let second = sealer.run_once(ctx.after_deadline()).await;
            let root = ctx.store.load(&tree.root.id()).await.unwrap();
            prop_assert_eq!(ctx.store.snapshot().unwrap(), first_snapshot.clone());
            Ok((root, first_snapshot, second))
        })?;

        let expected = if completed_count >= usize::try_from(quorum).unwrap() {
            QueryState::Completed
        } else {
            QueryState::Failed
        };
        prop_assert_eq!(root.state(), expected);
        prop_assert!(root.is_stale());
        prop_assert!(second.outcomes.is_empty());
        prop_assert!(!first_snapshot.is_empty());
    }
}
