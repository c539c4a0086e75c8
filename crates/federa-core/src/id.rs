//! Strongly-typed identifiers for federa entities.
//!
//! - [`QueryId`] is a ULID: lexicographically sortable by creation time and
//!   globally unique without coordination.
//! - [`DataSourceId`] is a validated, human-assigned name for an autonomous
//!   data source (for example `site-north`).
//!
//! # Example
//!
//! ```rust
//! use federa_core::id::{DataSourceId, QueryId};
//!
//! let root = QueryId::generate();
//! let child = QueryId::generate();
//! assert_ne!(root, child);
//!
//! let source = DataSourceId::new("site-north").unwrap();
//! assert_eq!(source.to_string(), "site-north");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a query context (root or per-data-source child).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(Ulid);

impl QueryId {
    /// Generates a new unique query ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a query ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid query ID '{s}': {e}"),
            })
    }
}

/// Identifier of an autonomous data source.
///
/// Data source IDs must be:
/// - Non-empty and at most 128 characters
/// - ASCII alphanumeric plus `-`, `_` and `.`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataSourceId(String);

impl DataSourceId {
    /// Creates a data source ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty, too long or contains invalid characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Returns the data source ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidId {
                message: "data source ID cannot be empty".to_string(),
            });
        }

        if id.len() > 128 {
            return Err(Error::InvalidId {
                message: format!("data source ID '{id}' is too long (maximum 128 characters)"),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Error::InvalidId {
                message: format!("data source ID '{id}' contains invalid characters"),
            });
        }

        Ok(())
    }
}

impl fmt::Display for DataSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DataSourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for DataSourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for DataSourceId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DataSourceId> for String {
    fn from(value: DataSourceId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_id_roundtrip() {
        let id = QueryId::generate();
        let parsed: QueryId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn query_ids_are_unique() {
        assert_ne!(QueryId::generate(), QueryId::generate());
    }

    #[test]
    fn invalid_query_id_returns_error() {
        let result: Result<QueryId> = "not-a-valid-ulid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn valid_data_source_ids() {
        assert!(DataSourceId::new("site-north").is_ok());
        assert!(DataSourceId::new("registry_2").is_ok());
        assert!(DataSourceId::new("eu.clinic.7").is_ok());
    }

    #[test]
    fn invalid_data_source_ids() {
        assert!(DataSourceId::new("").is_err());
        assert!(DataSourceId::new("has spaces").is_err());
        assert!(DataSourceId::new("slash/name").is_err());
        assert!(DataSourceId::new("x".repeat(129)).is_err());
    }

    #[test]
    fn data_source_id_deserialization_validates() {
        let ok: DataSourceId = serde_json::from_str("\"site-a\"").unwrap();
        assert_eq!(ok.as_str(), "site-a");

        let bad: std::result::Result<DataSourceId, _> = serde_json::from_str("\"bad id\"");
        assert!(bad.is_err());
    }
}
