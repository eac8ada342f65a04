//! Nearest-rank percentiles, recomputed per query

use serde::{Deserialize, Serialize};

/// Value at index `ceil(p/100 * n) - 1`, clamped to the slice.
///
/// `sorted` must be ascending. Returns `None` for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = (p / 100.0 * n as f64).ceil() as i64 - 1;
    let index = rank.clamp(0, n as i64 - 1) as usize;
    Some(sorted[index])
}

/// Sort a copy of `values` ascending
pub fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

/// Common percentiles of a sample set; all zero when empty
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl PercentileSummary {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let sorted = sorted(values);
        let at = |p: f64| percentile(&sorted, p).unwrap_or(0.0);

        Self {
            count: sorted.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p50: at(50.0),
            p90: at(90.0),
            p95: at(95.0),
            p99: at(99.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_rank() {
        let values = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile(&values, 50.0), Some(30.0));
        assert_eq!(percentile(&values, 100.0), Some(50.0));
        assert_eq!(percentile(&values, 0.0), Some(10.0));
        assert_eq!(percentile(&values, 95.0), Some(50.0));
        assert_eq!(percentile(&values, 20.0), Some(10.0));
        assert_eq!(percentile(&values, 21.0), Some(20.0));
    }

    #[test]
    fn test_empty() {
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(PercentileSummary::from_values(&[]), PercentileSummary::default());
    }

    #[test]
    fn test_summary_sorts_input() {
        let summary = PercentileSummary::from_values(&[50.0, 10.0, 40.0, 20.0, 30.0]);
        assert_eq!(summary.count, 5);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 50.0);
        assert_eq!(summary.mean, 30.0);
        assert_eq!(summary.p50, 30.0);
        assert_eq!(summary.p99, 50.0);
    }
}
