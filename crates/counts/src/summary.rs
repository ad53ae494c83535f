//! Read-only rollups derived from the count ledger.
//!
//! Pure derivations for reporting: these are never consulted for lifecycle
//! decisions (the state machine trusts only the ledger itself).

use serde::{Deserialize, Serialize};

use crate::count::CountLine;
use crate::variance::VarianceCategory;

/// Non-zero variances per severity bucket; exact counts are not tallied.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTally {
    pub minor: usize,
    pub moderate: usize,
    pub major: usize,
}

impl CategoryTally {
    fn bump(&mut self, category: VarianceCategory) {
        match category {
            VarianceCategory::Minor => self.minor += 1,
            VarianceCategory::Moderate => self.moderate += 1,
            VarianceCategory::Major => self.major += 1,
        }
    }
}

/// Per-count rollup of the item ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountSummary {
    pub total_items: usize,
    pub counted_items: usize,
    pub approved_items: usize,
    /// Counted items whose variance quantity is non-zero.
    pub items_with_variance: usize,
    /// Sum of signed variance values, smallest currency unit.
    pub total_variance_value: i64,
    /// `(total_items - items_with_variance) / total_items * 100`.
    ///
    /// An empty count reports 100%: nothing was found to disagree.
    pub accuracy_percent: f64,
    pub by_category: CategoryTally,
}

impl CountSummary {
    pub fn from_lines(lines: &[CountLine]) -> Self {
        let total_items = lines.len();
        let mut counted_items = 0;
        let mut approved_items = 0;
        let mut items_with_variance = 0;
        let mut total_variance_value = 0i64;
        let mut by_category = CategoryTally::default();

        for line in lines {
            if line.is_counted() {
                counted_items += 1;
            }
            if line.is_approved() {
                approved_items += 1;
            }
            if let Some(v) = &line.variance {
                total_variance_value += v.value;
                // Exact counts stay out of the tally: minor + moderate + major
                // always equals items_with_variance.
                if !v.is_zero() {
                    items_with_variance += 1;
                    if let Some(cat) = line.variance_category {
                        by_category.bump(cat);
                    }
                }
            }
        }

        let accuracy_percent = if total_items == 0 {
            100.0
        } else {
            (total_items - items_with_variance) as f64 / total_items as f64 * 100.0
        };

        Self {
            total_items,
            counted_items,
            approved_items,
            items_with_variance,
            total_variance_value,
            accuracy_percent,
            by_category,
        }
    }

    /// `counted / total` as a percentage (0 when the count has no items).
    pub fn progress_percent(&self) -> f64 {
        if self.total_items == 0 {
            0.0
        } else {
            self.counted_items as f64 / self.total_items as f64 * 100.0
        }
    }
}
