//! Pre-built test fixtures for common sealing scenarios.
//!
//! Provides a shared test context and a factory for query trees whose
//! children are already in the states a scenario needs.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use federa_core::DataSourceId;
use federa_flow::config::AggregationConfig;
use federa_flow::dispatch::memory::RecordingDispatcher;
use federa_flow::lifecycle::QueryLifecycle;
use federa_flow::query::{QueryContext, ResultContext, ResultRecord};
use federa_flow::sealer::StalenessSealer;
use federa_flow::store::QueryContextStore;
use federa_flow::store::memory::InMemoryQueryStore;
use federa_flow::submit::QuerySubmitter;

/// Source name used for fixture transitions.
pub const FIXTURE_SOURCE: &str = "fixture";

/// Test context with an in-memory store, a recording dispatcher and a fixed clock.
pub struct TestContext {
    /// Shared store.
    pub store: Arc<InMemoryQueryStore>,
    /// Shared dispatcher.
    pub dispatcher: Arc<RecordingDispatcher>,
    /// Fixed "current" instant used to build trees.
    pub now: DateTime<Utc>,
    /// Deadline given to trees built from this context.
    pub deadline: DateTime<Utc>,
}

impl TestContext {
    /// Creates a context at a fixed instant with a ten-minute deadline.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        Self {
            store: Arc::new(InMemoryQueryStore::new()),
            dispatcher: Arc::new(RecordingDispatcher::new()),
            now,
            deadline: now + Duration::minutes(10),
        }
    }

    /// An instant one minute past the deadline.
    #[must_use]
    pub fn after_deadline(&self) -> DateTime<Utc> {
        self.deadline + Duration::minutes(1)
    }

    /// An instant one minute before the deadline.
    #[must_use]
    pub fn before_deadline(&self) -> DateTime<Utc> {
        self.deadline - Duration::minutes(1)
    }

    /// A sealer over this context with default aggregation settings.
    #[must_use]
    pub fn sealer(&self) -> StalenessSealer {
        self.sealer_with(AggregationConfig::default())
    }

    /// A sealer over this context with the given aggregation settings.
    #[must_use]
    pub fn sealer_with(&self, aggregation: AggregationConfig) -> StalenessSealer {
        StalenessSealer::new(self.store.clone(), self.dispatcher.clone(), aggregation)
            .expect("valid aggregation config")
    }

    /// A submitter over this context.
    #[must_use]
    pub fn submitter(&self) -> QuerySubmitter {
        QuerySubmitter::new(self.store.clone(), self.dispatcher.clone())
    }

    /// Lifecycle callbacks over this context.
    #[must_use]
    pub fn lifecycle(&self) -> QueryLifecycle {
        QueryLifecycle::new(
            self.store.clone(),
            self.dispatcher.clone(),
            AggregationConfig::default(),
        )
        .expect("valid aggregation config")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// State a fixture child is driven to before insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutcome {
    /// Left in SUBMITTED.
    Submitted,
    /// Left in QUEUED.
    Queued,
    /// Left in EXECUTING.
    Executing,
    /// COMPLETED with a count-only result.
    Completed(u64),
    /// COMPLETED with record-level results.
    CompletedWithRecords(Vec<ResultRecord>),
    /// COMPLETED without a result context.
    CompletedWithoutResult,
    /// FAILED.
    Failed,
    /// STOPPED.
    Stopped,
}

/// A root and its children as inserted into the store.
#[derive(Debug, Clone)]
pub struct QueryTree {
    /// The root.
    pub root: QueryContext,
    /// The children, in the order they were added.
    pub children: Vec<QueryContext>,
}

impl QueryTree {
    /// The child for a data source.
    #[must_use]
    pub fn child(&self, data_source: &str) -> &QueryContext {
        self.children
            .iter()
            .find(|c| c.data_source_id().map(DataSourceId::as_str) == Some(data_source))
            .expect("fixture child exists")
    }
}

/// Builds query trees directly in the store.
pub struct QueryTreeFactory<'a> {
    ctx: &'a TestContext,
    root_entity: String,
    deadline: DateTime<Utc>,
    min_responding: u32,
    root_executing: bool,
    children: Vec<(String, ChildOutcome)>,
}

impl<'a> QueryTreeFactory<'a> {
    /// Starts a tree with an EXECUTING root, quorum 1 and the context deadline.
    #[must_use]
    pub fn new(ctx: &'a TestContext) -> Self {
        Self {
            ctx,
            root_entity: "Patient".to_string(),
            deadline: ctx.deadline,
            min_responding: 1,
            root_executing: true,
            children: Vec::new(),
        }
    }

    /// Sets the quorum.
    #[must_use]
    pub fn min_responding(mut self, min_responding: u32) -> Self {
        self.min_responding = min_responding;
        self
    }

    /// Sets the deadline.
    #[must_use]
    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Leaves the root in SUBMITTED.
    #[must_use]
    pub fn root_submitted(mut self) -> Self {
        self.root_executing = false;
        self
    }

    /// Adds a child.
    #[must_use]
    pub fn child(mut self, data_source: &str, outcome: ChildOutcome) -> Self {
        self.children.push((data_source.to_string(), outcome));
        self
    }

    /// Inserts the tree and returns the stored copies.
    pub async fn build(self) -> QueryTree {
        let now = self.ctx.now;
        let mut root =
            QueryContext::new_root(self.root_entity.clone(), self.deadline, self.min_responding, now);
        if self.root_executing {
            root.queue(FIXTURE_SOURCE, now).expect("queue root");
            root.start(FIXTURE_SOURCE, now).expect("start root");
        }
        self.ctx.store.insert(&root).await.expect("insert root");

        let mut children = Vec::with_capacity(self.children.len());
        for (source, outcome) in self.children {
            let data_source = DataSourceId::new(source.as_str()).expect("valid data source");
            let mut child = QueryContext::new_child(&root, data_source, now).expect("child");
            drive(&mut child, &source, outcome, &self.root_entity, now);
            self.ctx.store.insert(&child).await.expect("insert child");
            children.push(child);
        }

        QueryTree { root, children }
    }
}

fn drive(
    child: &mut QueryContext,
    source: &str,
    outcome: ChildOutcome,
    root_entity: &str,
    now: DateTime<Utc>,
) {
    if outcome == ChildOutcome::Submitted {
        return;
    }
    child.queue(FIXTURE_SOURCE, now).expect("queue child");
    if outcome == ChildOutcome::Queued {
        return;
    }
    child.start(FIXTURE_SOURCE, now).expect("start child");

    match outcome {
        ChildOutcome::Completed(n) => child
            .finish(source, ResultContext::count_only(root_entity, n), now)
            .expect("finish child"),
        ChildOutcome::CompletedWithRecords(records) => child
            .finish(source, ResultContext::from_records(root_entity, records), now)
            .expect("finish child"),
        ChildOutcome::CompletedWithoutResult => child
            .finish_without_result(source, now)
            .expect("finish child"),
        ChildOutcome::Failed => child.fail(source, "fixture failure", now).expect("fail child"),
        ChildOutcome::Stopped => child.stop(source, "fixture stop", now).expect("stop child"),
        ChildOutcome::Executing | ChildOutcome::Submitted | ChildOutcome::Queued => {}
    }
}

/// A patient record with gender and age group attributes.
#[must_use]
pub fn patient(key: &str, gender: &str, age_group: &str) -> ResultRecord {
    ResultRecord::new(key)
        .with_attribute("gender", gender)
        .with_attribute("age_group", age_group)
}

/// `count` patients sharing a key prefix and attributes.
#[must_use]
pub fn patients(prefix: &str, count: usize, gender: &str, age_group: &str) -> Vec<ResultRecord> {
    (0..count)
        .map(|i| patient(&format!("{prefix}-{i}"), gender, age_group))
        .collect()
}
