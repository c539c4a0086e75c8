//! Error types for the federated query orchestration domain.

use federa_core::QueryId;

/// The result type used throughout federa-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A state transition not allowed by the transition table was attempted.
    ///
    /// The query context is left untouched when this is returned.
    #[error("illegal state transition for query {query_id}: {from} -> {to} ({reason})")]
    IllegalStateTransition {
        /// The query whose transition was rejected.
        query_id: QueryId,
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// Why the transition is invalid.
        reason: String,
    },

    /// Configuration or request input is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// A data source reported completion without a usable result.
    #[error("partial data for query {query_id}: {message}")]
    PartialData {
        /// The child query carrying partial data.
        query_id: QueryId,
        /// Description of what is missing.
        message: String,
    },

    /// A query was not found in the store.
    #[error("query not found: {query_id}")]
    QueryNotFound {
        /// The query ID that was not found.
        query_id: QueryId,
    },

    /// An operation that requires a child query was given a root.
    #[error("query {query_id} is not a child query")]
    NotAChildQuery {
        /// The offending query.
        query_id: QueryId,
    },

    /// An operation that requires a root query was given a child.
    #[error("query {query_id} is not a root query")]
    NotARootQuery {
        /// The offending query.
        query_id: QueryId,
    },

    /// A child query was attached to a parent that is itself a child.
    #[error("query {query_id} cannot be nested under child query {parent_id}")]
    NestedChildQuery {
        /// The query being inserted.
        query_id: QueryId,
        /// The parent, which is already a child.
        parent_id: QueryId,
    },

    /// The stored version no longer matches; another writer got there first.
    #[error("concurrent modification of query {query_id} (expected version {expected_version})")]
    ConcurrentModification {
        /// The query that was modified concurrently.
        query_id: QueryId,
        /// The version the caller read.
        expected_version: u64,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Signalling a data source or downstream consumer failed.
    #[error("dispatch error: {message}")]
    Dispatch {
        /// Description of the dispatch failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from federa-core.
    #[error("core error: {0}")]
    Core(#[from] federa_core::Error),
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new dispatch error.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new dispatch error with a source.
    #[must_use]
    pub fn dispatch_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Dispatch {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns a short, stable label for metrics.
    #[must_use]
    pub const fn kind_label(&self) -> &'static str {
        match self {
            Self::IllegalStateTransition { .. } => "illegal_transition",
            Self::Configuration { .. } => "configuration",
            Self::PartialData { .. } => "partial_data",
            Self::QueryNotFound { .. } => "not_found",
            Self::NotAChildQuery { .. } | Self::NotARootQuery { .. } => "wrong_query_kind",
            Self::NestedChildQuery { .. } => "nested_child",
            Self::ConcurrentModification { .. } => "conflict",
            Self::Storage { .. } => "storage",
            Self::Dispatch { .. } => "dispatch",
            Self::Serialization { .. } => "serialization",
            Self::Core(_) => "core",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn illegal_transition_display() {
        let err = Error::IllegalStateTransition {
            query_id: QueryId::generate(),
            from: "SUBMITTED".into(),
            to: "COMPLETED".into(),
            reason: "valid transitions from SUBMITTED: [Queued]".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("SUBMITTED"));
        assert!(msg.contains("COMPLETED"));
        assert_eq!(err.kind_label(), "illegal_transition");
    }

    #[test]
    fn dispatch_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "adapter down");
        let err = Error::dispatch_with_source("stop_query failed", source);
        assert!(err.to_string().contains("dispatch error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn core_error_converts() {
        let core = federa_core::Error::InvalidInput("bad".into());
        let err: Error = core.into();
        assert_eq!(err.kind_label(), "core");
    }

    #[test]
    fn serde_error_converts_to_serialization() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
