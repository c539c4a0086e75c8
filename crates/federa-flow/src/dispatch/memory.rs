//! In-memory dispatcher that records every signal.
//!
//! Used by tests and by the `federa-sealer` replay tool, which prints the
//! recorded publications instead of sending them anywhere.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{DispatchSignal, Dispatcher};
use crate::aggregate::FederatedResult;
use crate::error::{Error, Result};
use crate::query::QueryContext;

/// Converts a lock poison error to a dispatch error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::dispatch("dispatcher lock poisoned")
}

/// Dispatcher that records signals in order.
///
/// ## Example
///
/// ```rust
/// use federa_flow::dispatch::memory::RecordingDispatcher;
///
/// let dispatcher = RecordingDispatcher::new();
/// assert!(dispatcher.signals().unwrap().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    signals: RwLock<Vec<DispatchSignal>>,
}

impl RecordingDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded signals in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn signals(&self) -> Result<Vec<DispatchSignal>> {
        let signals = self.signals.read().map_err(poison_err)?;
        Ok(signals.clone())
    }

    /// Returns every published federated result in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn publications(&self) -> Result<Vec<FederatedResult>> {
        let signals = self.signals.read().map_err(poison_err)?;
        Ok(signals
            .iter()
            .filter_map(|s| match s {
                DispatchSignal::Publish { result, .. } => Some(result.as_ref().clone()),
                _ => None,
            })
            .collect())
    }

    /// Counts recorded signals with the given label (`start`, `stop`, `publish`).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn count(&self, label: &str) -> Result<usize> {
        let signals = self.signals.read().map_err(poison_err)?;
        Ok(signals.iter().filter(|s| s.as_label() == label).count())
    }

    /// Clears all recorded signals.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clear(&self) -> Result<()> {
        let mut signals = self.signals.write().map_err(poison_err)?;
        signals.clear();
        drop(signals);
        Ok(())
    }

    fn record(&self, signal: DispatchSignal) -> Result<()> {
        tracing::debug!(query_id = %signal.query_id(), signal = signal.as_label(), "recorded dispatch signal");
        let mut signals = self.signals.write().map_err(poison_err)?;
        signals.push(signal);
        drop(signals);
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn start_query(&self, query: &QueryContext) -> Result<()> {
        self.record(DispatchSignal::Start {
            query_id: query.id(),
            data_source_id: query.data_source_id().cloned(),
        })
    }

    async fn stop_query(&self, query: &QueryContext) -> Result<()> {
        self.record(DispatchSignal::Stop {
            query_id: query.id(),
            data_source_id: query.data_source_id().cloned(),
        })
    }

    async fn publish_federated_result(
        &self,
        root: &QueryContext,
        result: &FederatedResult,
    ) -> Result<()> {
        self.record(DispatchSignal::Publish {
            query_id: root.id(),
            result: Box::new(result.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use federa_core::DataSourceId;

    #[tokio::test]
    async fn records_signals_in_order() -> Result<()> {
        let now = Utc::now();
        let root = QueryContext::new_root("Patient", now, 1, now);
        let child = QueryContext::new_child(&root, DataSourceId::new("site-a")?, now)?;
        let dispatcher = RecordingDispatcher::new();

        dispatcher.start_query(&child).await?;
        dispatcher.stop_query(&child).await?;
        dispatcher
            .publish_federated_result(&root, &FederatedResult::empty(root.id(), now))
            .await?;

        let labels: Vec<&str> = dispatcher
            .signals()?
            .iter()
            .map(DispatchSignal::as_label)
            .collect();
        assert_eq!(labels, vec!["start", "stop", "publish"]);
        assert_eq!(dispatcher.publications()?.len(), 1);
        assert_eq!(dispatcher.count("stop")?, 1);

        dispatcher.clear()?;
        assert!(dispatcher.signals()?.is_empty());
        Ok(())
    }
}
