//! Histogram cells, categories and the category schema.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One histogram cell.
///
/// Serialized as a JSON number for counts and as the string `"masked"`
/// for masked cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cell {
    /// A visible count.
    Count(u64),
    /// A count hidden by the privacy mask.
    Masked,
}

const MASKED: &str = "masked";

impl Cell {
    /// Returns the count, or `None` if masked.
    #[must_use]
    pub const fn count(&self) -> Option<u64> {
        match self {
            Self::Count(c) => Some(*c),
            Self::Masked => None,
        }
    }

    /// Adds two cells. A masked operand yields a masked result.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Count(a), Self::Count(b)) => Self::Count(a.saturating_add(b)),
            _ => Self::Masked,
        }
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::Count(0)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(c) => write!(f, "{c}"),
            Self::Masked => f.write_str(MASKED),
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Count(c) => serializer.serialize_u64(*c),
            Self::Masked => serializer.serialize_str(MASKED),
        }
    }
}

impl<'de> Deserialize<'de> for Cell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CellVisitor;

        impl Visitor<'_> for CellVisitor {
            type Value = Cell;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a non-negative count or the string \"{MASKED}\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Cell, E> {
                Ok(Cell::Count(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Cell, E> {
                u64::try_from(v)
                    .map(Cell::Count)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Cell, E> {
                if v == MASKED {
                    Ok(Cell::Masked)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }
        }

        deserializer.deserialize_any(CellVisitor)
    }
}

/// A named histogram: label to cell.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Category {
    /// Category name, e.g. `gender`.
    pub name: String,
    /// Ordered label to cell map.
    pub counts: BTreeMap<String, Cell>,
}

impl Category {
    /// Creates an empty category.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counts: BTreeMap::new(),
        }
    }

    /// Sets a label's count.
    #[must_use]
    pub fn with_count(mut self, label: impl Into<String>, count: u64) -> Self {
        self.counts.insert(label.into(), Cell::Count(count));
        self
    }

    /// Returns the cell for a label.
    #[must_use]
    pub fn get(&self, label: &str) -> Option<Cell> {
        self.counts.get(label).copied()
    }

    /// Increments a label by one.
    pub fn increment(&mut self, label: &str) {
        let cell = self.counts.entry(label.to_string()).or_default();
        *cell = cell.merge(Cell::Count(1));
    }

    /// Merges another category entry by entry: label union, count sum.
    pub fn merge(&mut self, other: &Self) {
        for (label, cell) in &other.counts {
            let entry = self.counts.entry(label.clone()).or_default();
            *entry = entry.merge(*cell);
        }
    }
}

/// Definition of one category in the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDefinition {
    /// Category name; matched against record attribute keys.
    pub name: String,
    /// Labels every view must report, zero-filled when absent.
    pub labels: Vec<String>,
}

impl CategoryDefinition {
    /// Creates a definition.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }
}

/// Ordered list of categories reported for every view.
///
/// A category's position in the schema is its index for
/// [`generated_aggregated_result`](super::AggregationEngine::generated_aggregated_result).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySchema {
    /// Categories in reporting order.
    pub categories: Vec<CategoryDefinition>,
}

impl CategorySchema {
    /// Creates a schema from definitions.
    #[must_use]
    pub const fn new(categories: Vec<CategoryDefinition>) -> Self {
        Self { categories }
    }

    /// Looks up a definition by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CategoryDefinition> {
        self.categories.iter().find(|c| c.name == name)
    }
}

impl Default for CategorySchema {
    fn default() -> Self {
        Self::new(vec![
            CategoryDefinition::new("gender", ["FEMALE", "MALE", "UNKNOWN"]),
            CategoryDefinition::new("age_group", ["0-17", "18-64", "65+", "UNKNOWN"]),
        ])
    }
}
