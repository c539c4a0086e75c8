//! Result views: which records a federated histogram is computed over.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use federa_core::DataSourceId;

use crate::error::{Error, Result};

const UNION: &str = "union";
const INTERSECTION: &str = "intersection";
const SOURCE_PREFIX: &str = "source:";

/// Identifies a result view.
///
/// Serialized as `"union"`, `"intersection"` or `"source:<data source id>"`,
/// which also makes it usable as a JSON map key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResultViewKey {
    /// Every record reported by any contributor, each key once.
    Union,
    /// Records whose key every contributor reported.
    Intersection,
    /// Records of a single data source.
    DataSource(DataSourceId),
}

impl fmt::Display for ResultViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Union => f.write_str(UNION),
            Self::Intersection => f.write_str(INTERSECTION),
            Self::DataSource(id) => write!(f, "{SOURCE_PREFIX}{id}"),
        }
    }
}

impl FromStr for ResultViewKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            UNION => Ok(Self::Union),
            INTERSECTION => Ok(Self::Intersection),
            other => other
                .strip_prefix(SOURCE_PREFIX)
                .ok_or_else(|| Error::configuration(format!("unknown result view key '{other}'")))
                .and_then(|id| Ok(Self::DataSource(DataSourceId::new(id)?))),
        }
    }
}

impl Serialize for ResultViewKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResultViewKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct KeyVisitor;

        impl Visitor<'_> for KeyVisitor {
            type Value = ResultViewKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"union\", \"intersection\" or \"source:<id>\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<ResultViewKey, E> {
                v.parse().map_err(|e: Error| E::custom(e))
            }
        }

        deserializer.deserialize_str(KeyVisitor)
    }
}

/// Which views the engine generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ViewSelection {
    /// Generate the union view.
    pub union: bool,
    /// Generate the intersection view.
    pub intersection: bool,
    /// Generate one view per completed data source.
    pub per_data_source: bool,
}

impl Default for ViewSelection {
    fn default() -> Self {
        Self {
            union: true,
            intersection: true,
            per_data_source: true,
        }
    }
}

/// The record set behind one view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultView {
    /// View identity.
    pub key: ResultViewKey,
    /// Data sources whose records make up the view, in data source order.
    pub data_sources: Vec<DataSourceId>,
    /// Distinct record keys in the view.
    pub record_keys: BTreeSet<String>,
    /// Number of records in the view.
    ///
    /// Count-only contributors add their reported count to union and
    /// per-source views.
    pub num_records: u64,
}

impl ResultView {
    /// Creates a view with no contributors.
    #[must_use]
    pub const fn empty(key: ResultViewKey) -> Self {
        Self {
            key,
            data_sources: Vec::new(),
            record_keys: BTreeSet::new(),
            num_records: 0,
        }
    }

    /// Returns true if no data source contributed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data_sources.is_empty()
    }
}
