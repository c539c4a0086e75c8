//! End-to-end sealing scenarios over the in-memory store.

#![allow(clippy::expect_used)]

use std::sync::Arc;

use federa_flow::aggregate::{Cell, ResultViewKey};
use federa_flow::config::AggregationConfig;
use federa_flow::error::Result;
use federa_flow::query::QueryState;
use federa_flow::sealer::{Disposition, SealPath, SealStage, StalenessSealer};
use federa_flow::store::QueryContextStore;
use federa_test_utils::{
    ChildOutcome, FaultyDispatcher, FaultyStore, QueryTreeFactory, TestContext,
    assert_history_ordered, assert_no_small_counts, assert_published_once, assert_report_clean,
    assert_sealed_stale, init_test_logging, patients,
};

#[tokio::test]
async fn stale_root_with_one_completed_child_is_published() -> Result<()> {
    init_test_logging();
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx)
        .min_responding(1)
        .child("site-1", ChildOutcome::Completed(120))
        .child("site-2", ChildOutcome::Failed)
        .build()
        .await;

    let report = ctx.sealer().run_once(ctx.after_deadline()).await;

    assert_report_clean(&report);
    let root = ctx.store.load(&tree.root.id()).await?;
    assert_sealed_stale(&root, QueryState::Completed);
    assert_eq!(root.num_records(), 120);
    assert_history_ordered(&root);

    let published = assert_published_once(&ctx.dispatcher, root.id());
    assert_eq!(published.num_records, Cell::Count(120));
    Ok(())
}

#[tokio::test]
async fn two_of_three_reaches_quorum_on_both_paths() -> Result<()> {
    for stale in [true, false] {
        let ctx = TestContext::new();
        let tree = QueryTreeFactory::new(&ctx)
            .min_responding(2)
            .child("site-a", ChildOutcome::Completed(10))
            .child("site-b", ChildOutcome::Completed(20))
            .child("site-c", ChildOutcome::Failed)
            .build()
            .await;
        let now = if stale {
            ctx.after_deadline()
        } else {
            ctx.before_deadline()
        };

        let report = ctx.sealer().run_once(now).await;

        let root = ctx.store.load(&tree.root.id()).await?;
        assert_eq!(root.state(), QueryState::Completed);
        assert_eq!(root.is_stale(), stale);
        assert_eq!(root.num_records(), 30);
        let expected_path = if stale {
            SealPath::Stale
        } else {
            SealPath::EarlyCompletion
        };
        assert_eq!(
            report.outcome_for(root.id()).map(|o| o.path),
            Some(expected_path)
        );
        assert_published_once(&ctx.dispatcher, root.id());
    }
    Ok(())
}

#[tokio::test]
async fn one_of_three_below_quorum_fails_on_both_paths() -> Result<()> {
    for stale in [true, false] {
        let ctx = TestContext::new();
        let tree = QueryTreeFactory::new(&ctx)
            .min_responding(2)
            .child("site-a", ChildOutcome::Completed(10))
            .child("site-b", ChildOutcome::Failed)
            .child("site-c", ChildOutcome::Failed)
            .build()
            .await;
        let now = if stale {
            ctx.after_deadline()
        } else {
            ctx.before_deadline()
        };

        ctx.sealer().run_once(now).await;

        let root = ctx.store.load(&tree.root.id()).await?;
        assert_eq!(root.state(), QueryState::Failed);
        assert_eq!(root.is_stale(), stale);
        assert!(ctx.dispatcher.publications()?.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn second_pass_changes_nothing() -> Result<()> {
    let ctx = TestContext::new();
    QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Completed(40))
        .child("site-b", ChildOutcome::Executing)
        .build()
        .await;
    let sealer = ctx.sealer();

    let first = sealer.run_once(ctx.after_deadline()).await;
    let after_first = ctx.store.snapshot()?;
    let second = sealer.run_once(ctx.after_deadline()).await;

    assert_eq!(first.published_count(), 1);
    assert!(second.outcomes.is_empty());
    assert_eq!(ctx.store.snapshot()?, after_first);
    assert_eq!(ctx.dispatcher.publications()?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn every_unresolved_child_state_is_escalated() -> Result<()> {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx)
        .child("a-submitted", ChildOutcome::Submitted)
        .child("b-queued", ChildOutcome::Queued)
        .child("c-executing", ChildOutcome::Executing)
        .child("d-stopped", ChildOutcome::Stopped)
        .child("e-completed", ChildOutcome::Completed(50))
        .build()
        .await;

    let report = ctx.sealer().run_once(ctx.after_deadline()).await;

    assert_report_clean(&report);
    for source in ["a-submitted", "b-queued", "c-executing", "d-stopped"] {
        let child = ctx.store.load(&tree.child(source).id()).await?;
        assert_sealed_stale(&child, QueryState::Failed);
        assert_history_ordered(&child);
    }
    let completed = ctx.store.load(&tree.child("e-completed").id()).await?;
    assert!(!completed.is_stale());

    let root = ctx.store.load(&tree.root.id()).await?;
    assert_sealed_stale(&root, QueryState::Completed);
    assert_eq!(root.num_records(), 50);
    Ok(())
}

#[tokio::test]
async fn childless_root_fails_at_deadline() -> Result<()> {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx).build().await;

    ctx.sealer().run_once(ctx.after_deadline()).await;

    let root = ctx.store.load(&tree.root.id()).await?;
    assert_sealed_stale(&root, QueryState::Failed);
    Ok(())
}

#[tokio::test]
async fn submitted_root_is_escalated_and_failed() -> Result<()> {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx).root_submitted().build().await;

    ctx.sealer().run_once(ctx.after_deadline()).await;

    let root = ctx.store.load(&tree.root.id()).await?;
    assert_sealed_stale(&root, QueryState::Failed);
    let messages: Vec<&str> = root
        .status_history()
        .iter()
        .map(|e| e.message.as_str())
        .collect();
    assert_eq!(messages[0], "queued");
    assert_eq!(messages[1], "execution started");
    assert!(messages[2].starts_with("failed"));
    assert_eq!(messages[3], "marked stale");
    Ok(())
}

#[tokio::test]
async fn published_histograms_hide_small_counts() -> Result<()> {
    let ctx = TestContext::new();
    let mut records = patients("a", 7, "FEMALE", "18-64");
    records.extend(patients("b", 2, "MALE", "65+"));
    let tree = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::CompletedWithRecords(records))
        .build()
        .await;

    ctx.sealer().run_once(ctx.after_deadline()).await;

    let published = assert_published_once(&ctx.dispatcher, tree.root.id());
    assert_no_small_counts(&published, AggregationConfig::default().mask.boundary);
    let union = &published.results[&ResultViewKey::Union];
    assert!(
        union
            .iter()
            .flat_map(|c| c.counts.values())
            .any(|cell| *cell == Cell::Masked)
    );
    Ok(())
}

#[tokio::test]
async fn publish_failure_is_isolated_to_its_root() -> Result<()> {
    let ctx = TestContext::new();
    let failing = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Completed(10))
        .build()
        .await;
    let healthy = QueryTreeFactory::new(&ctx)
        .child("site-b", ChildOutcome::Completed(20))
        .build()
        .await;
    let dispatcher = Arc::new(FaultyDispatcher::new());
    dispatcher.fail_publish_for(failing.root.id());
    let sealer = StalenessSealer::new(
        ctx.store.clone(),
        dispatcher.clone(),
        AggregationConfig::default(),
    )?;

    let report = sealer.run_once(ctx.after_deadline()).await;

    assert!(matches!(
        report.outcome_for(failing.root.id()).map(|o| &o.disposition),
        Some(Disposition::Errored {
            stage: SealStage::Publish,
            ..
        })
    ));
    // The state is persisted before publishing.
    let sealed = ctx.store.load(&failing.root.id()).await?;
    assert_sealed_stale(&sealed, QueryState::Completed);

    let publications = dispatcher.recorded().publications()?;
    assert_eq!(publications.len(), 1);
    assert_eq!(publications[0].query_id, healthy.root.id());
    Ok(())
}

#[tokio::test]
async fn stop_failure_is_a_warning() -> Result<()> {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Executing)
        .build()
        .await;
    let child_id = tree.child("site-a").id();
    let dispatcher = Arc::new(FaultyDispatcher::new());
    dispatcher.fail_stop_for(child_id);
    let sealer = StalenessSealer::new(
        ctx.store.clone(),
        dispatcher,
        AggregationConfig::default(),
    )?;

    let report = sealer.run_once(ctx.after_deadline()).await;

    let outcome = report.outcome_for(child_id).expect("child outcome");
    assert_eq!(
        outcome.disposition,
        Disposition::Sealed {
            state: QueryState::Failed,
            published: false
        }
    );
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].stage, SealStage::Stop);
    assert!(!report.is_clean());
    Ok(())
}

#[tokio::test]
async fn persist_failure_does_not_stop_other_queries() -> Result<()> {
    let ctx = TestContext::new();
    let broken = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Executing)
        .child("site-b", ChildOutcome::Completed(10))
        .build()
        .await;
    let other = QueryTreeFactory::new(&ctx)
        .child("site-c", ChildOutcome::Completed(30))
        .build()
        .await;
    let store = Arc::new(FaultyStore::wrap(ctx.store.clone()));
    let stuck_child = broken.child("site-a").id();
    store.fail_update_for(stuck_child);
    let sealer = StalenessSealer::new(store, ctx.dispatcher.clone(), AggregationConfig::default())?;

    let report = sealer.run_once(ctx.after_deadline()).await;

    assert!(matches!(
        report.outcome_for(stuck_child).map(|o| &o.disposition),
        Some(Disposition::Errored {
            stage: SealStage::Persist,
            ..
        })
    ));
    assert_eq!(
        ctx.store.load(&stuck_child).await?.state(),
        QueryState::Executing
    );
    assert_eq!(
        ctx.store.load(&broken.root.id()).await?.state(),
        QueryState::Completed
    );
    assert_eq!(
        ctx.store.load(&other.root.id()).await?.state(),
        QueryState::Completed
    );
    Ok(())
}

#[tokio::test]
async fn version_conflict_leaves_query_for_next_pass() -> Result<()> {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Completed(10))
        .build()
        .await;
    let store = Arc::new(FaultyStore::wrap(ctx.store.clone()));
    store.conflict_update_for(tree.root.id());
    let sealer = StalenessSealer::new(store, ctx.dispatcher.clone(), AggregationConfig::default())?;

    let report = sealer.run_once(ctx.after_deadline()).await;

    assert!(matches!(
        report.outcome_for(tree.root.id()).map(|o| &o.disposition),
        Some(Disposition::Conflict { .. })
    ));
    let root = ctx.store.load(&tree.root.id()).await?;
    assert_eq!(root.state(), QueryState::Executing);
    assert!(!root.is_stale());
    assert!(ctx.dispatcher.publications()?.is_empty());

    // A sealer over the healthy store picks it up.
    ctx.sealer().run_once(ctx.after_deadline()).await;
    assert_sealed_stale(
        &ctx.store.load(&tree.root.id()).await?,
        QueryState::Completed,
    );
    Ok(())
}

#[tokio::test]
async fn finder_failure_is_reported_not_raised() {
    let ctx = TestContext::new();
    QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Completed(10))
        .build()
        .await;
    let store = Arc::new(FaultyStore::wrap(ctx.store.clone()));
    store.fail_finders();
    let sealer = StalenessSealer::new(store, ctx.dispatcher.clone(), AggregationConfig::default())
        .expect("valid aggregation config");

    let report = sealer.run_once(ctx.after_deadline()).await;

    assert_eq!(report.errors.len(), 2);
    assert!(report.outcomes.is_empty());
}

#[tokio::test]
async fn sealed_child_refreshes_its_root() -> Result<()> {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Completed(10))
        .child("site-b", ChildOutcome::Executing)
        .build()
        .await;
    let store = Arc::new(FaultyStore::wrap(ctx.store.clone()));
    store.fail_update_for(tree.root.id());
    let sealer = StalenessSealer::new(store, ctx.dispatcher.clone(), AggregationConfig::default())?;

    let report = sealer.run_once(ctx.after_deadline()).await;

    // The refresh of the root fails, so the child carries a warning but stays sealed.
    let child = report
        .outcome_for(tree.child("site-b").id())
        .expect("child outcome");
    assert!(matches!(
        child.disposition,
        Disposition::Sealed {
            state: QueryState::Failed,
            ..
        }
    ));
    assert_eq!(child.warnings.len(), 1);
    assert_eq!(child.warnings[0].stage, SealStage::Aggregate);
    assert_sealed_stale(
        &ctx.store.load(&tree.child("site-b").id()).await?,
        QueryState::Failed,
    );
    Ok(())
}

#[tokio::test]
async fn healthy_pass_refreshes_root_before_deciding_it() -> Result<()> {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Completed(10))
        .child("site-b", ChildOutcome::Executing)
        .build()
        .await;
    let before = ctx.store.load(&tree.root.id()).await?;
    assert_eq!(before.result_context(), None);

    let report = ctx.sealer().run_once(ctx.after_deadline()).await;

    assert_report_clean(&report);
    let root = ctx.store.load(&tree.root.id()).await?;
    assert_sealed_stale(&root, QueryState::Completed);
    assert_eq!(root.num_records(), 10);
    // One write from the child's parent refresh, one from the root's own seal.
    assert_eq!(root.version(), before.version() + 2);
    Ok(())
}
