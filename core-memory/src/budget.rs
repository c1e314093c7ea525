//! # Resource Budget Calculator
//!
//! Derives how many chapter workers fit in memory. Each worker loads its own
//! synthesis and cleaning model, so concurrency is bounded by
//! `(total - reserved - margin) / per_unit`, clamped to `[1, hard_cap]`.

use core_runtime::config::BudgetSettings;
use std::fmt;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Maximum number of workers that fit in the budget.
///
/// - A non-positive `per_unit` means the footprint is unknown; the cap wins.
/// - Any NaN input yields 1.
/// - A `hard_cap` of 0 is treated as 1.
///
/// ```
/// use core_memory::budget::compute_max_concurrency;
///
/// assert_eq!(compute_max_concurrency(32.0, 2.0, 1.0, 2.0, 4), 4);
/// assert_eq!(compute_max_concurrency(8.0, 2.0, 1.0, 2.0, 4), 2);
/// assert_eq!(compute_max_concurrency(2.0, 2.0, 1.0, 2.0, 4), 1);
/// ```
pub fn compute_max_concurrency(
    total: f64,
    reserved: f64,
    margin: f64,
    per_unit: f64,
    hard_cap: usize,
) -> usize {
    let cap = hard_cap.max(1);

    if total.is_nan() || reserved.is_nan() || margin.is_nan() || per_unit.is_nan() {
        return 1;
    }

    if per_unit <= 0.0 {
        return cap;
    }

    let available = total - reserved - margin;
    if available <= 0.0 {
        return 1;
    }

    let fits = (available / per_unit).floor();
    if fits >= cap as f64 {
        cap
    } else {
        (fits as usize).clamp(1, cap)
    }
}

/// Immutable memory budget for one conversion run, in gigabytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceBudget {
    total_gb: f64,
    reserved_gb: f64,
    margin_gb: f64,
    per_unit_gb: f64,
    hard_cap: usize,
    max_concurrency: usize,
}

impl ResourceBudget {
    pub fn new(total_gb: f64, reserved_gb: f64, margin_gb: f64, per_unit_gb: f64, hard_cap: usize) -> Self {
        Self {
            total_gb,
            reserved_gb,
            margin_gb,
            per_unit_gb,
            hard_cap,
            max_concurrency: compute_max_concurrency(
                total_gb,
                reserved_gb,
                margin_gb,
                per_unit_gb,
                hard_cap,
            ),
        }
    }

    /// Budget with one synthesis plus one cleaning model per worker.
    pub fn from_settings(settings: &BudgetSettings) -> Self {
        Self::new(
            settings.total_gb,
            settings.reserved_gb,
            settings.safety_margin_gb,
            settings.per_unit_gb(),
            settings.hard_cap,
        )
    }

    /// Same budget with a different total, e.g. an operator override.
    pub fn with_total(&self, total_gb: f64) -> Self {
        Self::new(
            total_gb,
            self.reserved_gb,
            self.margin_gb,
            self.per_unit_gb,
            self.hard_cap,
        )
    }

    pub fn total_gb(&self) -> f64 {
        self.total_gb
    }

    pub fn per_unit_gb(&self) -> f64 {
        self.per_unit_gb
    }

    /// Gigabytes left for models, never negative.
    pub fn available(&self) -> f64 {
        let available = self.total_gb - self.reserved_gb - self.margin_gb;
        if available.is_nan() {
            0.0
        } else {
            available.max(0.0)
        }
    }

    pub fn available_bytes(&self) -> u64 {
        (self.available() * GIB) as u64
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Bytes each of `workers` concurrent workers may use.
    pub fn per_worker_share(&self, workers: usize) -> u64 {
        self.available_bytes() / workers.max(1) as u64
    }

    pub fn summary(&self) -> BudgetSummary {
        BudgetSummary {
            available_gb: self.available(),
            per_unit_gb: self.per_unit_gb,
            max_concurrency: self.max_concurrency,
        }
    }
}

/// Display helper used when logging the chosen budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSummary {
    pub available_gb: f64,
    pub per_unit_gb: f64,
    pub max_concurrency: usize,
}

impl fmt::Display for BudgetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1} GB available, {:.1} GB per worker, {} concurrent",
            self.available_gb, self.per_unit_gb, self.max_concurrency
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_hit_hard_cap() {
        let budget = ResourceBudget::from_settings(&BudgetSettings::default());

        assert_eq!(budget.available(), 29.0);
        assert_eq!(budget.per_unit_gb(), 2.0);
        assert_eq!(budget.max_concurrency(), 4);
    }

    #[test]
    fn test_tight_memory_limits_concurrency() {
        let settings = BudgetSettings {
            total_gb: 8.0,
            ..BudgetSettings::default()
        };
        let budget = ResourceBudget::from_settings(&settings);

        assert_eq!(budget.available(), 5.0);
        assert_eq!(budget.max_concurrency(), 2);
    }

    #[test]
    fn test_result_always_within_bounds() {
        let totals = [0.0, 1.0, 3.5, 8.0, 16.0, 64.0, 1024.0, -4.0];
        let footprints = [0.25, 0.5, 1.0, 2.0, 7.5, 100.0];

        for &total in &totals {
            for &per_unit in &footprints {
                for cap in 0..6 {
                    let n = compute_max_concurrency(total, 2.0, 1.0, per_unit, cap);
                    assert!(n >= 1, "total={} per_unit={} cap={}", total, per_unit, cap);
                    assert!(n <= cap.max(1), "total={} per_unit={} cap={}", total, per_unit, cap);
                }
            }
        }
    }

    #[test]
    fn test_non_increasing_in_footprint() {
        let mut previous = usize::MAX;
        for step in 1..40 {
            let per_unit = step as f64 * 0.25;
            let n = compute_max_concurrency(32.0, 2.0, 1.0, per_unit, 16);
            assert!(n <= previous, "per_unit={} gave {} after {}", per_unit, n, previous);
            previous = n;
        }
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(compute_max_concurrency(32.0, 2.0, 1.0, 0.0, 4), 4);
        assert_eq!(compute_max_concurrency(32.0, 2.0, 1.0, -1.0, 4), 4);
        assert_eq!(compute_max_concurrency(f64::NAN, 2.0, 1.0, 2.0, 4), 1);
        assert_eq!(compute_max_concurrency(32.0, 2.0, 1.0, f64::NAN, 4), 1);
        assert_eq!(compute_max_concurrency(32.0, 2.0, 1.0, 2.0, 0), 1);
        assert_eq!(compute_max_concurrency(f64::INFINITY, 0.0, 0.0, 1.0, 3), 3);
    }

    #[test]
    fn test_with_total_recomputes() {
        let budget = ResourceBudget::from_settings(&BudgetSettings::default());
        let smaller = budget.with_total(6.0);

        assert_eq!(smaller.max_concurrency(), 1);
        assert_eq!(smaller.per_unit_gb(), budget.per_unit_gb());
        assert_eq!(budget.max_concurrency(), 4);
    }

    #[test]
    fn test_per_worker_share_splits_available() {
        let budget = ResourceBudget::new(10.0, 1.0, 1.0, 2.0, 4);

        assert_eq!(budget.per_worker_share(2), 4 * 1024 * 1024 * 1024);
        assert_eq!(budget.per_worker_share(0), budget.available_bytes());
    }

    #[test]
    fn test_summary_display() {
        let budget = ResourceBudget::new(8.0, 2.0, 1.0, 2.0, 4);
        assert_eq!(
            budget.summary().to_string(),
            "5.0 GB available, 2.0 GB per worker, 2 concurrent"
        );
    }
}
