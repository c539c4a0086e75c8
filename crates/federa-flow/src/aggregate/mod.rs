//! Aggregation of per-data-source results into a federated answer.
//!
//! The pipeline for a completed root is:
//!
//! 1. [`generate_result_views`](AggregationEngine::generate_result_views): union,
//!    intersection and per-source record sets over completed children
//! 2. [`generated_aggregated_results`](AggregationEngine::generated_aggregated_results):
//!    one histogram per schema category per view
//! 3. [`add_missing_data_entries`](AggregationEngine::add_missing_data_entries):
//!    zero-fill every schema category and label
//! 4. [`scrub_results`](AggregationEngine::scrub_results): mask small counts
//!
//! Masking is always the last step, so nothing leaves the engine unmasked.
//!
//! ## Partial data
//!
//! A COMPLETED child without a result context is treated as an empty
//! contribution. It is logged, counted, excluded from view contributors and
//! listed in [`FederatedResult::partial_data_sources`].

pub mod category;
pub mod mask;
pub mod view;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use federa_core::{DataSourceId, QueryId};

use crate::config::AggregationConfig;
use crate::error::{Error, Result};
use crate::metrics::FederaMetrics;
use crate::query::{QueryContext, QueryState, ResultContext};
use crate::store::QueryContextStore;

pub use category::{Category, CategoryDefinition, CategorySchema, Cell};
pub use mask::MaskPolicy;
pub use view::{ResultView, ResultViewKey, ViewSelection};

/// Histograms per view.
pub type AggregatedResults = BTreeMap<ResultViewKey, Vec<Category>>;

/// The privacy-safe answer to a federated query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedResult {
    /// The root query.
    pub query_id: QueryId,
    /// Masked total of records across completed data sources.
    pub num_records: Cell,
    /// Masked record count per view.
    pub view_counts: BTreeMap<ResultViewKey, Cell>,
    /// Masked histograms per view.
    pub results: AggregatedResults,
    /// Data sources that completed without a result.
    #[serde(default)]
    pub partial_data_sources: Vec<DataSourceId>,
    /// When the result was generated.
    pub generated_at: DateTime<Utc>,
}

impl FederatedResult {
    /// An all-zero result with no views.
    #[must_use]
    pub fn empty(query_id: QueryId, generated_at: DateTime<Utc>) -> Self {
        Self {
            query_id,
            num_records: Cell::Count(0),
            view_counts: BTreeMap::new(),
            results: AggregatedResults::new(),
            partial_data_sources: Vec::new(),
            generated_at,
        }
    }

    /// Serializes to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] on failure.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Deserializes from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the input is not a valid result.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Into::into)
    }
}

/// Completed children split by whether they carried a result.
struct Contributors<'a> {
    with_result: Vec<(&'a DataSourceId, &'a ResultContext)>,
    partial: Vec<DataSourceId>,
}

fn contributors<'a>(children: &'a [QueryContext]) -> Contributors<'a> {
    let mut completed: Vec<&QueryContext> = children
        .iter()
        .filter(|c| c.state() == QueryState::Completed && c.data_source_id().is_some())
        .collect();
    completed.sort_by(|a, b| a.data_source_id().cmp(&b.data_source_id()));

    let mut with_result = Vec::new();
    let mut partial = Vec::new();
    for child in completed {
        let Some(source) = child.data_source_id() else {
            continue;
        };
        if let Some(rc) = child.result_context() {
            with_result.push((source, rc));
        } else {
            let diagnostic = Error::PartialData {
                query_id: child.id(),
                message: format!("data source {source} completed without a result context"),
            };
            tracing::warn!(
                query_id = %child.id(),
                data_source = %source,
                error = %diagnostic,
                "treating as empty contribution"
            );
            FederaMetrics::new().record_partial_data();
            partial.push(source.clone());
        }
    }
    Contributors {
        with_result,
        partial,
    }
}

fn count_only_total(contributors: &[(&DataSourceId, &ResultContext)]) -> u64 {
    contributors
        .iter()
        .filter(|(_, rc)| rc.records.is_empty())
        .map(|(_, rc)| rc.num_records)
        .sum()
}

fn key_count(keys: &BTreeSet<String>) -> u64 {
    u64::try_from(keys.len()).unwrap_or(u64::MAX)
}

/// Builds views, histograms and masks for completed query trees.
pub struct AggregationEngine {
    store: Arc<dyn QueryContextStore>,
    config: AggregationConfig,
}

impl std::fmt::Debug for AggregationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AggregationEngine {
    /// Creates an engine over a store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` is invalid, including a
    /// zero mask boundary.
    pub fn new(store: Arc<dyn QueryContextStore>, config: AggregationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// The engine's configuration.
    #[must_use]
    pub const fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Recomputes and persists a root's provisional record count after a
    /// child changed.
    ///
    /// The count is re-derived from all COMPLETED children on every call, so
    /// repeated calls leave the root unchanged. Terminal roots are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAChildQuery`] for a root, [`Error::QueryNotFound`]
    /// if the parent is missing, and store errors including
    /// [`Error::ConcurrentModification`].
    #[tracing::instrument(skip(self, child), fields(query_id = %child.id()))]
    pub async fn update_parent_state(&self, child: &QueryContext) -> Result<()> {
        let parent_id = child
            .parent_id()
            .ok_or(Error::NotAChildQuery { query_id: child.id() })?;
        let mut root = self.store.load(&parent_id).await?;
        if root.is_terminal() {
            tracing::debug!(root_id = %root.id(), state = %root.state(), "root is terminal; not refreshing");
            return Ok(());
        }

        let children = self.store.find_children(&parent_id).await?;
        let provisional = Self::root_result_context(&root, &children);
        if root.result_context() == Some(&provisional) {
            return Ok(());
        }

        let num_records = provisional.num_records;
        root.refresh_provisional_result(provisional)?;
        self.store.update_checked(&mut root).await?;
        tracing::debug!(root_id = %root.id(), num_records, "refreshed provisional root result");
        Ok(())
    }

    /// The root's result computed from its children.
    ///
    /// Sums the record counts of COMPLETED children. Failed, missing and
    /// partial children contribute zero.
    #[must_use]
    pub fn root_result_context(root: &QueryContext, children: &[QueryContext]) -> ResultContext {
        let total = children
            .iter()
            .filter(|c| c.parent_id() == Some(root.id()) && c.state() == QueryState::Completed)
            .map(QueryContext::num_records)
            .sum::<u64>();
        ResultContext::count_only(root.root_entity(), total)
    }

    /// Loads the root's children and builds its result views.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotARootQuery`] for a child, or a store error.
    pub async fn generate_result_views(
        &self,
        root: &QueryContext,
    ) -> Result<BTreeMap<ResultViewKey, ResultView>> {
        let children = self.children_of(root).await?;
        Ok(self.views_for(&children))
    }

    /// Loads the root's children and builds unmasked histograms for every view.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotARootQuery`] for a child, or a store error.
    pub async fn generated_aggregated_results(
        &self,
        root: &QueryContext,
    ) -> Result<AggregatedResults> {
        let children = self.children_of(root).await?;
        let views = self.views_for(&children);
        Ok(self.histograms_for(&views, &children))
    }

    /// The masked, zero-filled category at schema position `index` for one view.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `view_key` is not generated for
    /// this root or `index` is outside the schema.
    pub async fn generated_aggregated_result(
        &self,
        root: &QueryContext,
        view_key: &ResultViewKey,
        index: usize,
    ) -> Result<Category> {
        let definition = self.config.schema.categories.get(index).ok_or_else(|| {
            Error::configuration(format!(
                "category index {index} out of range (schema has {} categories)",
                self.config.schema.categories.len()
            ))
        })?;

        let children = self.children_of(root).await?;
        let views = self.views_for(&children);
        let Some(view) = views.get(view_key) else {
            return Err(Error::configuration(format!(
                "unknown result view '{view_key}' for query {}",
                root.id()
            )));
        };

        let single = BTreeMap::from([(view_key.clone(), view.clone())]);
        let mut results = self.histograms_for(&single, &children);
        self.add_missing_data_entries(&mut results, &single);
        self.scrub_results(&mut results);

        Ok(results
            .remove(view_key)
            .and_then(|categories| categories.into_iter().find(|c| c.name == definition.name))
            .unwrap_or_else(|| Category::new(definition.name.clone())))
    }

    /// Ensures every view has an entry containing every schema category and label.
    ///
    /// Absent labels are inserted as `Count(0)`. Labels outside the schema are
    /// kept. Categories are ordered as in the schema, extra categories last.
    pub fn add_missing_data_entries(
        &self,
        results: &mut AggregatedResults,
        views: &BTreeMap<ResultViewKey, ResultView>,
    ) {
        for key in views.keys() {
            let existing = results.remove(key).unwrap_or_default();
            let mut by_name: BTreeMap<String, Category> = existing
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect();

            let mut completed = Vec::with_capacity(self.config.schema.categories.len());
            for definition in &self.config.schema.categories {
                let mut category = by_name
                    .remove(&definition.name)
                    .unwrap_or_else(|| Category::new(definition.name.clone()));
                for label in &definition.labels {
                    category.counts.entry(label.clone()).or_default();
                }
                completed.push(category);
            }
            completed.extend(by_name.into_values());
            results.insert(key.clone(), completed);
        }
    }

    /// Masks small counts in place; returns the number of masked cells.
    pub fn scrub_results(&self, results: &mut AggregatedResults) -> usize {
        let masked = self.config.mask.scrub(results);
        FederaMetrics::new().record_masked_cells(masked);
        masked
    }

    /// Runs the full pipeline over an already-loaded tree.
    ///
    /// Children that belong to other roots are ignored. With no children or
    /// no data the result is well formed and all zero.
    #[tracing::instrument(skip(self, root, children), fields(query_id = %root.id()))]
    pub fn aggregate(
        &self,
        root: &QueryContext,
        children: &[QueryContext],
        now: DateTime<Utc>,
    ) -> FederatedResult {
        let own: Vec<QueryContext> = children
            .iter()
            .filter(|c| c.parent_id() == Some(root.id()))
            .cloned()
            .collect();

        let views = self.views_for(&own);
        let mut results = self.histograms_for(&views, &own);
        self.add_missing_data_entries(&mut results, &views);
        let masked_cells = self.scrub_results(&mut results);

        let view_counts = views
            .iter()
            .map(|(key, view)| (key.clone(), self.config.mask.mask_count(view.num_records)))
            .collect();

        let partial_data_sources = contributors(&own).partial;
        let total = Self::root_result_context(root, &own).num_records;

        tracing::info!(
            num_records = total,
            views = views.len(),
            masked_cells,
            partial = partial_data_sources.len(),
            "aggregated federated result"
        );

        FederatedResult {
            query_id: root.id(),
            num_records: self.config.mask.mask_count(total),
            view_counts,
            results,
            partial_data_sources,
            generated_at: now,
        }
    }

    async fn children_of(&self, root: &QueryContext) -> Result<Vec<QueryContext>> {
        if !root.is_root() {
            return Err(Error::NotARootQuery { query_id: root.id() });
        }
        self.store.find_children(&root.id()).await
    }

    fn views_for(&self, children: &[QueryContext]) -> BTreeMap<ResultViewKey, ResultView> {
        let selection = self.config.views;
        let Contributors { with_result, .. } = contributors(children);
        let mut views = BTreeMap::new();

        if selection.union {
            let mut view = ResultView::empty(ResultViewKey::Union);
            for (source, rc) in &with_result {
                view.data_sources.push((*source).clone());
                view.record_keys
                    .extend(rc.records.iter().map(|r| r.key.clone()));
            }
            view.num_records = key_count(&view.record_keys) + count_only_total(&with_result);
            views.insert(view.key.clone(), view);
        }

        if selection.intersection {
            let mut view = ResultView::empty(ResultViewKey::Intersection);
            let mut keys: Option<BTreeSet<String>> = None;
            for (source, rc) in &with_result {
                view.data_sources.push((*source).clone());
                let these: BTreeSet<String> = rc.records.iter().map(|r| r.key.clone()).collect();
                keys = Some(match keys {
                    None => these,
                    Some(acc) => acc.intersection(&these).cloned().collect(),
                });
            }
            view.record_keys = keys.unwrap_or_default();
            view.num_records = key_count(&view.record_keys);
            views.insert(view.key.clone(), view);
        }

        if selection.per_data_source {
            for child in children.iter().filter(|c| c.state() == QueryState::Completed) {
                let Some(source) = child.data_source_id() else {
                    continue;
                };
                let key = ResultViewKey::DataSource(source.clone());
                let mut view = ResultView::empty(key.clone());
                if let Some(rc) = child.result_context() {
                    view.data_sources.push(source.clone());
                    view.record_keys = rc.records.iter().map(|r| r.key.clone()).collect();
                    view.num_records = if rc.records.is_empty() {
                        rc.num_records
                    } else {
                        key_count(&view.record_keys)
                    };
                }
                views.insert(key, view);
            }
        }

        views
    }

    /// Per-view histograms. Each contributor builds a partial histogram over
    /// the view's records it holds; a key already claimed by an earlier
    /// contributor (data source order) is skipped. Partials merge label-wise.
    fn histograms_for(
        &self,
        views: &BTreeMap<ResultViewKey, ResultView>,
        children: &[QueryContext],
    ) -> AggregatedResults {
        let Contributors { with_result, .. } = contributors(children);
        let mut results = AggregatedResults::new();

        for (key, view) in views {
            let mut claimed: HashSet<&str> = HashSet::new();
            let mut merged: Vec<Category> = Vec::new();

            for (source, rc) in &with_result {
                if !view.data_sources.contains(source) {
                    continue;
                }
                let mut partial: Vec<Category> = self
                    .config
                    .schema
                    .categories
                    .iter()
                    .map(|d| Category::new(d.name.clone()))
                    .collect();

                for record in &rc.records {
                    if !view.record_keys.contains(&record.key) || !claimed.insert(&record.key) {
                        continue;
                    }
                    for category in &mut partial {
                        if let Some(label) = record.attributes.get(&category.name) {
                            category.increment(label);
                        }
                    }
                }

                for category in partial.into_iter().filter(|c| !c.counts.is_empty()) {
                    match merged.iter_mut().find(|m| m.name == category.name) {
                        Some(existing) => existing.merge(&category),
                        None => merged.push(category),
                    }
                }
            }

            merged.sort_by_key(|c| {
                self.config
                    .schema
                    .categories
                    .iter()
                    .position(|d| d.name == c.name)
                    .unwrap_or(usize::MAX)
            });
            results.insert(key.clone(), merged);
        }

        results
    }
}
