//! Signals from the engine to data source adapters and result consumers.
//!
//! This module provides:
//!
//! - [`Dispatcher`]: Trait for starting and stopping child queries and
//!   publishing federated results
//! - [`RecordingDispatcher`](memory::RecordingDispatcher): In-memory dispatcher
//!   that records every signal, for testing and replay tooling
//!
//! How a query is translated for a particular data source and how results
//! travel are the implementor's concern.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use federa_core::{DataSourceId, QueryId};

use crate::aggregate::FederatedResult;
use crate::error::Result;
use crate::query::QueryContext;

/// Transport abstraction for query signals.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` so one dispatcher can be shared by the
/// submitter, the lifecycle callbacks and the sealer.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Asks the child's data source to start executing the query.
    async fn start_query(&self, query: &QueryContext) -> Result<()>;

    /// Asks the child's data source to stop executing the query.
    ///
    /// Callers treat failures as best effort.
    async fn stop_query(&self, query: &QueryContext) -> Result<()>;

    /// Hands a completed root's federated result to downstream consumers.
    async fn publish_federated_result(
        &self,
        root: &QueryContext,
        result: &FederatedResult,
    ) -> Result<()>;
}

/// A signal recorded by an in-memory dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum DispatchSignal {
    /// `start_query` was called.
    Start {
        /// The child query.
        query_id: QueryId,
        /// Its data source.
        data_source_id: Option<DataSourceId>,
    },
    /// `stop_query` was called.
    Stop {
        /// The query being stopped.
        query_id: QueryId,
        /// Its data source, if a child.
        data_source_id: Option<DataSourceId>,
    },
    /// `publish_federated_result` was called.
    Publish {
        /// The root query.
        query_id: QueryId,
        /// The published result.
        result: Box<FederatedResult>,
    },
}

impl DispatchSignal {
    /// The query this signal refers to.
    #[must_use]
    pub const fn query_id(&self) -> QueryId {
        match self {
            Self::Start { query_id, .. }
            | Self::Stop { query_id, .. }
            | Self::Publish { query_id, .. } => *query_id,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Publish { .. } => "publish",
        }
    }
}
