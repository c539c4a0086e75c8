//! Small-count suppression.
//!
//! Any count strictly between zero and the boundary is replaced with
//! [`Cell::Masked`]. Zero and counts at or above the boundary pass through.

use serde::{Deserialize, Serialize};

use super::AggregatedResults;
use super::category::Cell;
use crate::error::{Error, Result};

/// Default mask boundary.
pub const DEFAULT_MASK_BOUNDARY: u64 = 5;

/// Privacy mask configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskPolicy {
    /// Smallest count that may be reported as-is.
    pub boundary: u64,
}

impl Default for MaskPolicy {
    fn default() -> Self {
        Self {
            boundary: DEFAULT_MASK_BOUNDARY,
        }
    }
}

impl MaskPolicy {
    /// Creates a policy with the given boundary.
    #[must_use]
    pub const fn new(boundary: u64) -> Self {
        Self { boundary }
    }

    /// Checks the policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the boundary is zero.
    pub fn validate(&self) -> Result<()> {
        if self.boundary == 0 {
            return Err(Error::configuration("mask boundary must be positive"));
        }
        Ok(())
    }

    /// Masks a single count.
    #[must_use]
    pub const fn mask_count(&self, count: u64) -> Cell {
        if count > 0 && count < self.boundary {
            Cell::Masked
        } else {
            Cell::Count(count)
        }
    }

    /// Masks a cell in place; returns true if it was masked by this call.
    pub fn mask_cell(&self, cell: &mut Cell) -> bool {
        match *cell {
            Cell::Count(c) => {
                *cell = self.mask_count(c);
                *cell == Cell::Masked
            }
            Cell::Masked => false,
        }
    }

    /// Masks every cell of every category of every view.
    ///
    /// Returns the number of cells masked.
    pub fn scrub(&self, results: &mut AggregatedResults) -> usize {
        results
            .values_mut()
            .flat_map(|categories| categories.iter_mut())
            .flat_map(|category| category.counts.values_mut())
            .map(|cell| self.mask_cell(cell))
            .filter(|masked| *masked)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::category::Category;
    use crate::aggregate::view::ResultViewKey;

    #[test]
    fn masks_only_small_positive_counts() {
        let policy = MaskPolicy::new(5);
        let mut results = AggregatedResults::new();
        results.insert(
            ResultViewKey::Union,
            vec![
                Category::new("gender")
                    .with_count("A", 3)
                    .with_count("B", 0)
                    .with_count("C", 7),
            ],
        );

        let masked = policy.scrub(&mut results);

        assert_eq!(masked, 1);
        let category = &results[&ResultViewKey::Union][0];
        assert_eq!(category.get("A"), Some(Cell::Masked));
        assert_eq!(category.get("B"), Some(Cell::Count(0)));
        assert_eq!(category.get("C"), Some(Cell::Count(7)));
    }

    #[test]
    fn boundary_value_is_visible() {
        let policy = MaskPolicy::new(5);
        assert_eq!(policy.mask_count(5), Cell::Count(5));
        assert_eq!(policy.mask_count(4), Cell::Masked);
    }

    #[test]
    fn zero_boundary_is_rejected() {
        assert!(MaskPolicy::new(0).validate().is_err());
        assert!(MaskPolicy::default().validate().is_ok());
    }
}
