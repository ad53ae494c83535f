//! Variance arithmetic and classification (pure, total functions).

use serde::{Deserialize, Serialize};

use stocktally_core::ValueObject;

/// Severity bucket for a variance, derived from its relative magnitude.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarianceCategory {
    Minor,
    Moderate,
    Major,
}

impl core::fmt::Display for VarianceCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            VarianceCategory::Minor => "minor",
            VarianceCategory::Moderate => "moderate",
            VarianceCategory::Major => "major",
        };
        f.write_str(s)
    }
}

/// Signed difference between counted and system quantity.
///
/// All fields are integers so events and read models stay exactly
/// comparable: `percent_bp` is the relative variance in basis points
/// (1% = 100 bp), truncated toward zero; `value` is in the smallest
/// currency unit, signed (positive = more stock found than expected).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variance {
    /// `counted_qty - system_qty`.
    pub qty: i64,
    /// Relative variance in basis points of the system quantity.
    pub percent_bp: i64,
    /// `qty * unit_cost`, in smallest currency unit.
    pub value: i64,
}

impl Variance {
    pub fn is_zero(&self) -> bool {
        self.qty == 0
    }

    /// Relative variance as a percentage, for display layers.
    pub fn percent(&self) -> f64 {
        self.percent_bp as f64 / 100.0
    }
}

impl ValueObject for Variance {}

/// Compute the variance triple for one counted line.
///
/// Total over its domain: a zero system quantity yields 100% when anything
/// was counted and 0% otherwise, never a division error. The denominator is
/// `|system_qty|` so a negative snapshot cannot flip the sign of the
/// relative variance.
pub fn compute_variance(system_qty: i64, counted_qty: i64, unit_cost: u64) -> Variance {
    let qty = counted_qty - system_qty;

    let percent_bp = if system_qty == 0 {
        if counted_qty > 0 { 10_000 } else { 0 }
    } else {
        // i128 intermediate: qty * 10_000 can exceed i64 for extreme counts.
        ((qty as i128 * 10_000) / (system_qty.abs() as i128)) as i64
    };

    let value = (qty as i128 * unit_cost as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64;

    Variance {
        qty,
        percent_bp,
        value,
    }
}

/// Injectable classification thresholds.
///
/// The authoritative minor/moderate/major boundaries are owner-configurable
/// policy, not a constant. Defaults: minor ≤ 5%, moderate ≤ 15%, major
/// above.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariancePolicy {
    /// Largest absolute variance (basis points) still classified minor.
    pub minor_max_bp: u32,
    /// Largest absolute variance (basis points) still classified moderate.
    pub moderate_max_bp: u32,
}

impl Default for VariancePolicy {
    fn default() -> Self {
        Self {
            minor_max_bp: 500,
            moderate_max_bp: 1_500,
        }
    }
}

impl VariancePolicy {
    /// Build a policy from whole-percent thresholds, validating ordering.
    pub fn from_percents(minor_max: u32, moderate_max: u32) -> Result<Self, crate::CountError> {
        if minor_max > moderate_max {
            return Err(crate::CountError::validation(
                "minor threshold cannot exceed moderate threshold",
            ));
        }
        Ok(Self {
            minor_max_bp: minor_max * 100,
            moderate_max_bp: moderate_max * 100,
        })
    }

    /// Classify by absolute relative variance.
    pub fn classify(&self, percent_bp: i64) -> VarianceCategory {
        let abs = percent_bp.unsigned_abs();
        if abs <= self.minor_max_bp as u64 {
            VarianceCategory::Minor
        } else if abs <= self.moderate_max_bp as u64 {
            VarianceCategory::Moderate
        } else {
            VarianceCategory::Major
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn shortage_is_negative() {
        let v = compute_variance(10, 8, 300);
        assert_eq!(v.qty, -2);
        assert_eq!(v.percent_bp, -2_000);
        assert_eq!(v.value, -600);
    }

    #[test]
    fn surplus_is_positive() {
        let v = compute_variance(4, 7, 125);
        assert_eq!(v.qty, 3);
        assert_eq!(v.percent_bp, 7_500);
        assert_eq!(v.value, 375);
    }

    #[test]
    fn zero_system_qty_with_finds_is_full_variance() {
        let v = compute_variance(0, 5, 100);
        assert_eq!(v.qty, 5);
        assert_eq!(v.percent_bp, 10_000);
        assert_eq!(v.value, 500);
    }

    #[test]
    fn zero_system_qty_with_zero_count_is_no_variance() {
        let v = compute_variance(0, 0, 100);
        assert!(v.is_zero());
        assert_eq!(v.percent_bp, 0);
    }

    #[test]
    fn exact_count_has_no_variance() {
        let v = compute_variance(42, 42, 999);
        assert_eq!(v, Variance { qty: 0, percent_bp: 0, value: 0 });
    }

    #[test]
    fn default_policy_thresholds() {
        let p = VariancePolicy::default();
        assert_eq!(p.classify(0), VarianceCategory::Minor);
        assert_eq!(p.classify(500), VarianceCategory::Minor);
        assert_eq!(p.classify(-501), VarianceCategory::Moderate);
        assert_eq!(p.classify(1_500), VarianceCategory::Moderate);
        assert_eq!(p.classify(1_501), VarianceCategory::Major);
        assert_eq!(p.classify(-10_000), VarianceCategory::Major);
    }

    #[test]
    fn policy_rejects_inverted_thresholds() {
        assert!(VariancePolicy::from_percents(20, 10).is_err());
        let p = VariancePolicy::from_percents(5, 15).unwrap();
        assert_eq!(p, VariancePolicy::default());
    }

    proptest! {
        #[test]
        fn qty_and_value_are_exact(
            system in -1_000_000i64..1_000_000,
            counted in 0i64..1_000_000,
            cost in 0u64..1_000_000,
        ) {
            let v = compute_variance(system, counted, cost);
            prop_assert_eq!(v.qty, counted - system);
            prop_assert_eq!(v.value, v.qty * cost as i64);
        }

        #[test]
        fn percent_sign_follows_qty(
            system in 1i64..1_000_000,
            counted in 0i64..1_000_000,
        ) {
            let v = compute_variance(system, counted, 1);
            prop_assert_eq!(v.percent_bp.signum(), (v.qty * 10_000 / system).signum());
        }

        #[test]
        fn classify_is_total(bp in i64::MIN..i64::MAX) {
            // Never panics, whatever the magnitude.
            let _ = VariancePolicy::default().classify(bp);
        }
    }
}
