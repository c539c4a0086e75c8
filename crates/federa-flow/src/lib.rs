//! # federa-flow
//!
//! Orchestration engine for federated queries.
//!
//! One logical query fans out to many autonomous data sources. This crate
//! tracks each data source's execution independently, decides when the
//! federated result is "done enough" under partial failure, and merges the
//! per-source results into a privacy-safe aggregate.
//!
//! ## Core Concepts
//!
//! - **Query tree**: A root [`QueryContext`](query::QueryContext) plus one child
//!   per data source. Trees are exactly one level deep.
//! - **Sealing**: The [`StalenessSealer`](sealer::StalenessSealer) resolves queries
//!   whose deadline passed, or whose children have all reported, into a terminal state.
//! - **Quorum**: A root completes when at least `min_responding_data_sources`
//!   children completed; otherwise it fails.
//! - **Aggregation**: The [`AggregationEngine`](aggregate::AggregationEngine) builds
//!   union, intersection and per-source histograms and masks small counts.
//!
//! ## Guarantees
//!
//! - **Table-driven lifecycle**: Every state change is validated against a fixed
//!   transition table and recorded in the status history
//! - **Idempotent sealing**: A second pass over sealed queries does nothing
//! - **Isolation**: One failing query never aborts a sealing pass
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use chrono::{Duration, Utc};
//! use federa_flow::config::EngineConfig;
//! use federa_flow::dispatch::memory::RecordingDispatcher;
//! use federa_flow::sealer::StalenessSealer;
//! use federa_flow::store::memory::InMemoryQueryStore;
//! use federa_flow::submit::{FederatedQueryRequest, QuerySubmitter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> federa_flow::error::Result<()> {
//! let store = Arc::new(InMemoryQueryStore::new());
//! let dispatcher = Arc::new(RecordingDispatcher::new());
//! let config = EngineConfig::default();
//!
//! let now = Utc::now();
//! let request = FederatedQueryRequest::new("Patient", now + Duration::minutes(10))
//!     .with_data_source("site-north")?
//!     .with_data_source("site-south")?
//!     .with_min_responding(1);
//!
//! let submitter = QuerySubmitter::new(store.clone(), dispatcher.clone());
//! let root_id = submitter.submit(request, now).await?;
//!
//! let sealer = StalenessSealer::new(store, dispatcher, config.aggregation)?;
//! let report = sealer.run_once(now + Duration::minutes(11)).await;
//! assert!(report.outcomes.iter().any(|o| o.query_id == root_id));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod query;
pub mod sealer;
pub mod service;
pub mod store;
pub mod submit;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::aggregate::{
        AggregatedResults, AggregationEngine, Category, Cell, FederatedResult, ResultViewKey,
    };
    pub use crate::config::{AggregationConfig, EngineConfig, SealerConfig};
    pub use crate::dispatch::Dispatcher;
    pub use crate::error::{Error, Result};
    pub use crate::lifecycle::QueryLifecycle;
    pub use crate::query::{QueryContext, QueryState, ResultContext, ResultRecord};
    pub use crate::sealer::{SealReport, StalenessSealer};
    pub use crate::service::SealerService;
    pub use crate::store::{CasResult, QueryContextStore};
    pub use crate::submit::{FederatedQueryRequest, QuerySubmitter};
}
