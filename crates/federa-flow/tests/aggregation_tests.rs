//! Aggregation engine behavior over stored query trees.

#![allow(clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use federa_core::DataSourceId;
use federa_flow::aggregate::{
    AggregatedResults, AggregationEngine, Category, CategoryDefinition, CategorySchema, Cell,
    MaskPolicy, ResultView, ResultViewKey, ViewSelection,
};
use federa_flow::config::AggregationConfig;
use federa_flow::error::{Error, Result};
use federa_flow::lifecycle::QueryLifecycle;
use federa_flow::query::ResultContext;
use federa_flow::sealer::StalenessSealer;
use federa_flow::store::QueryContextStore;
use federa_test_utils::{ChildOutcome, QueryTreeFactory, TestContext, patient, patients};

fn engine(ctx: &TestContext, config: AggregationConfig) -> AggregationEngine {
    AggregationEngine::new(ctx.store.clone(), config).expect("valid aggregation config")
}

fn source(id: &str) -> ResultViewKey {
    ResultViewKey::DataSource(DataSourceId::new(id).expect("valid id"))
}

#[tokio::test]
async fn views_cover_union_intersection_and_each_source() -> Result<()> {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx)
        .child(
            "site-a",
            ChildOutcome::CompletedWithRecords(vec![
                patient("p1", "FEMALE", "18-64"),
                patient("p2", "MALE", "65+"),
            ]),
        )
        .child(
            "site-b",
            ChildOutcome::CompletedWithRecords(vec![
                patient("p2", "MALE", "65+"),
                patient("p3", "FEMALE", "0-17"),
            ]),
        )
        .child("site-c", ChildOutcome::Failed)
        .build()
        .await;

    let views = engine(&ctx, AggregationConfig::default())
        .generate_result_views(&tree.root)
        .await?;

    let keys: Vec<&ResultViewKey> = views.keys().collect();
    assert_eq!(
        keys,
        vec![
            &ResultViewKey::Union,
            &ResultViewKey::Intersection,
            &source("site-a"),
            &source("site-b"),
        ]
    );
    assert_eq!(views[&ResultViewKey::Union].num_records, 3);
    assert_eq!(views[&ResultViewKey::Intersection].num_records, 1);
    assert!(views[&ResultViewKey::Intersection].record_keys.contains("p2"));
    assert_eq!(views[&source("site-b")].num_records, 2);
    Ok(())
}

#[tokio::test]
async fn disabled_views_are_not_generated() -> Result<()> {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Completed(10))
        .build()
        .await;
    let config = AggregationConfig {
        views: ViewSelection {
            union: true,
            intersection: false,
            per_data_source: false,
        },
        ..AggregationConfig::default()
    };

    let views = engine(&ctx, config).generate_result_views(&tree.root).await?;

    assert_eq!(views.len(), 1);
    // Count-only sources still count toward the union.
    assert_eq!(views[&ResultViewKey::Union].num_records, 10);
    Ok(())
}

#[tokio::test]
async fn histograms_count_shared_records_once() -> Result<()> {
    let ctx = TestContext::new();
    let mut site_a = patients("a", 6, "FEMALE", "18-64");
    site_a.push(patient("shared", "MALE", "65+"));
    let mut site_b = patients("b", 6, "MALE", "18-64");
    site_b.push(patient("shared", "MALE", "65+"));
    let tree = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::CompletedWithRecords(site_a))
        .child("site-b", ChildOutcome::CompletedWithRecords(site_b))
        .build()
        .await;

    let results = engine(&ctx, AggregationConfig::default())
        .generated_aggregated_results(&tree.root)
        .await?;

    let union = &results[&ResultViewKey::Union];
    let gender = union.iter().find(|c| c.name == "gender").expect("gender");
    assert_eq!(gender.get("FEMALE"), Some(Cell::Count(6)));
    assert_eq!(gender.get("MALE"), Some(Cell::Count(7)));
    // Unmasked at this stage.
    let age = union.iter().find(|c| c.name == "age_group").expect("age");
    assert_eq!(age.get("65+"), Some(Cell::Count(1)));
    Ok(())
}

#[tokio::test]
async fn single_category_lookup_is_masked_and_complete() -> Result<()> {
    let ctx = TestContext::new();
    let mut records = patients("f", 8, "FEMALE", "18-64");
    records.extend(patients("m", 3, "MALE", "18-64"));
    let tree = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::CompletedWithRecords(records))
        .build()
        .await;
    let engine = engine(&ctx, AggregationConfig::default());

    let gender = engine
        .generated_aggregated_result(&tree.root, &ResultViewKey::Union, 0)
        .await?;

    assert_eq!(gender.name, "gender");
    assert_eq!(gender.get("FEMALE"), Some(Cell::Count(8)));
    assert_eq!(gender.get("MALE"), Some(Cell::Masked));
    assert_eq!(gender.get("UNKNOWN"), Some(Cell::Count(0)));

    assert!(matches!(
        engine
            .generated_aggregated_result(&tree.root, &ResultViewKey::Union, 9)
            .await,
        Err(Error::Configuration { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn aggregation_rejects_child_as_root() {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Completed(1))
        .build()
        .await;

    let result = engine(&ctx, AggregationConfig::default())
        .generate_result_views(tree.child("site-a"))
        .await;

    assert!(matches!(result, Err(Error::NotARootQuery { .. })));
}

#[test]
fn missing_labels_are_zero_filled() {
    let ctx = TestContext::new();
    let config = AggregationConfig {
        schema: CategorySchema::new(vec![CategoryDefinition::new(
            "gender",
            ["FEMALE", "MALE", "UNKNOWN"],
        )]),
        ..AggregationConfig::default()
    };
    let engine = engine(&ctx, config);
    let mut results = AggregatedResults::new();
    results.insert(
        ResultViewKey::Union,
        vec![Category::new("gender").with_count("MALE", 10)],
    );
    let views = BTreeMap::from([(
        ResultViewKey::Union,
        ResultView::empty(ResultViewKey::Union),
    )]);

    engine.add_missing_data_entries(&mut results, &views);

    let gender = &results[&ResultViewKey::Union][0];
    assert_eq!(gender.get("MALE"), Some(Cell::Count(10)));
    assert_eq!(gender.get("FEMALE"), Some(Cell::Count(0)));
    assert_eq!(gender.get("UNKNOWN"), Some(Cell::Count(0)));
}

#[test]
fn scrub_masks_between_zero_and_boundary() {
    let ctx = TestContext::new();
    let config = AggregationConfig {
        mask: MaskPolicy::new(5),
        ..AggregationConfig::default()
    };
    let engine = engine(&ctx, config);
    let mut results = AggregatedResults::new();
    results.insert(
        ResultViewKey::Union,
        vec![
            Category::new("letters")
                .with_count("A", 3)
                .with_count("B", 0)
                .with_count("C", 7),
        ],
    );

    assert_eq!(engine.scrub_results(&mut results), 1);

    let letters = &results[&ResultViewKey::Union][0];
    assert_eq!(letters.get("A"), Some(Cell::Masked));
    assert_eq!(letters.get("B"), Some(Cell::Count(0)));
    assert_eq!(letters.get("C"), Some(Cell::Count(7)));
}

#[tokio::test]
async fn parent_refresh_is_idempotent_and_stops_at_terminal() -> Result<()> {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Completed(25))
        .child("site-b", ChildOutcome::Executing)
        .build()
        .await;
    let engine = engine(&ctx, AggregationConfig::default());
    let child = tree.child("site-a");

    engine.update_parent_state(child).await?;
    let once = ctx.store.load(&tree.root.id()).await?;
    engine.update_parent_state(child).await?;
    let twice = ctx.store.load(&tree.root.id()).await?;

    assert_eq!(once.num_records(), 25);
    assert_eq!(once, twice);

    let mut root = twice;
    root.fail("test", "done", ctx.now)?;
    ctx.store.update_checked(&mut root).await?;
    engine.update_parent_state(child).await?;
    assert_eq!(ctx.store.load(&tree.root.id()).await?, root);
    Ok(())
}

#[tokio::test]
async fn partial_source_is_reported_in_result() -> Result<()> {
    let ctx = TestContext::new();
    let tree = QueryTreeFactory::new(&ctx)
        .child("site-a", ChildOutcome::Completed(12))
        .child("site-b", ChildOutcome::CompletedWithoutResult)
        .build()
        .await;
    let children = ctx.store.find_children(&tree.root.id()).await?;
    let engine = AggregationEngine::new(
        Arc::clone(&ctx.store) as Arc<dyn QueryContextStore>,
        AggregationConfig::default(),
    )?;

    let result = engine.aggregate(&tree.root, &children, ctx.now);

    assert_eq!(
        result.partial_data_sources,
        vec![DataSourceId::new("site-b")?]
    );
    assert_eq!(result.num_records, Cell::Count(12));
    assert_eq!(
        AggregationEngine::root_result_context(&tree.root, &children),
        ResultContext::count_only("Patient", 12)
    );
    Ok(())
}

#[test]
fn zero_mask_boundary_is_rejected_at_construction() {
    let ctx = TestContext::new();
    let config = AggregationConfig {
        mask: MaskPolicy::new(0),
        ..AggregationConfig::default()
    };

    assert!(matches!(
        AggregationEngine::new(ctx.store.clone(), config.clone()),
        Err(Error::Configuration { .. })
    ));
    assert!(matches!(
        StalenessSealer::new(ctx.store.clone(), ctx.dispatcher.clone(), config.clone()),
        Err(Error::Configuration { .. })
    ));
    assert!(matches!(
        QueryLifecycle::new(ctx.store.clone(), ctx.dispatcher.clone(), config),
        Err(Error::Configuration { .. })
    ));
}
