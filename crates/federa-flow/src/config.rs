//! Engine configuration.
//!
//! Loaded from JSON. Every field has a default, so `{}` is a valid file.
//!
//! ```json
//! {
//!   "sealer": { "interval": "30s", "historySource": "sealer" },
//!   "aggregation": {
//!     "mask": { "boundary": 5 },
//!     "schema": { "categories": [ { "name": "gender", "labels": ["FEMALE", "MALE", "UNKNOWN"] } ] },
//!     "views": { "union": true, "intersection": true, "perDataSource": true }
//!   }
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::{CategorySchema, MaskPolicy, ViewSelection};
use crate::error::{Error, Result};

/// Default sealer interval (30 seconds).
const DEFAULT_SEALER_INTERVAL_SECS: u64 = 30;

/// Default status history source name for sealer entries.
pub const DEFAULT_HISTORY_SOURCE: &str = "sealer";

fn default_interval() -> Duration {
    Duration::from_secs(DEFAULT_SEALER_INTERVAL_SECS)
}

fn default_history_source() -> String {
    DEFAULT_HISTORY_SOURCE.to_string()
}

/// Staleness sealer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealerConfig {
    /// Time between sealer passes.
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
    /// Source name written into status history entries.
    #[serde(default = "default_history_source")]
    pub history_source: String,
}

impl Default for SealerConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            history_source: default_history_source(),
        }
    }
}

/// Aggregation and masking settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregationConfig {
    /// Privacy mask.
    pub mask: MaskPolicy,
    /// Categories reported for every view.
    pub schema: CategorySchema,
    /// Views to generate.
    pub views: ViewSelection,
}

impl AggregationConfig {
    /// Checks the aggregation settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a zero mask boundary, an empty or
    /// duplicate category name, or a selection with no views.
    pub fn validate(&self) -> Result<()> {
        self.mask.validate()?;

        let mut seen = HashSet::new();
        for category in &self.schema.categories {
            if category.name.is_empty() {
                return Err(Error::configuration("category name cannot be empty"));
            }
            if !seen.insert(category.name.as_str()) {
                return Err(Error::configuration(format!(
                    "duplicate category '{}' in schema",
                    category.name
                )));
            }
        }

        if !(self.views.union || self.views.intersection || self.views.per_data_source) {
            return Err(Error::configuration("at least one result view must be enabled"));
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Sealer settings.
    pub sealer: SealerConfig,
    /// Aggregation settings.
    pub aggregation: AggregationConfig,
}

impl EngineConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the JSON is malformed or invalid.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the file cannot be read or is invalid.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Checks every section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.sealer.interval.is_zero() {
            return Err(Error::configuration("sealer interval must be positive"));
        }
        if self.sealer.history_source.is_empty() {
            return Err(Error::configuration("sealer history source cannot be empty"));
        }
        self.aggregation.validate()
    }
}
