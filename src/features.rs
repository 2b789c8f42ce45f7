//! Statistical feature extraction over inter-arrival deltas.
//!
//! # Statistical Methodology
//!
//! ## Percentiles
//! Percentiles use linear interpolation between order statistics: for a
//! sorted series of length n the p-th percentile sits at zero-based rank
//! r = p/100 · (n − 1), interpolated between ⌊r⌋ and ⌈r⌉. Other conventions
//! (nearest-rank, midpoint) shift the scores.
//!
//! ## Bowley Skewness
//! skew = (P20 + P80 − 2·P50) / (P80 − P20)
//!
//! Beacons produce a symmetric delta distribution (skew ≈ 0); human browsing
//! produces a long right tail (skew → 1). When the spread collapses
//! (P50 equals either bound) the skew is reported as [`Skew::Degenerate`].
//!
//! ## Median Absolute Deviation
//! MAD = median(|Δᵢ − median(Δ)|), in seconds. Small for jittered beacons,
//! large for bursty traffic.
//!
//! ## Transfer Sizes
//! When the log carries byte counts, the same quartile skew and MAD are
//! computed over the bytes sent per observation ([`SizeFeatures`]).

use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution, Max, Min};

use crate::deltas::DeltaSeries;
use crate::error::AnalyzerError;

/// Percentile points used for the quartile statistics.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PercentilePoints {
    pub low: f64,
    pub mid: f64,
    pub high: f64,
}

impl Default for PercentilePoints {
    fn default() -> Self {
        Self {
            low: 20.0,
            mid: 50.0,
            high: 80.0,
        }
    }
}

impl PercentilePoints {
    /// True when 0 ≤ low < mid < high ≤ 100.
    pub fn is_valid(&self) -> bool {
        (0.0..=100.0).contains(&self.low)
            && (0.0..=100.0).contains(&self.high)
            && self.low < self.mid
            && self.mid < self.high
    }
}

/// Outcome of the Bowley skewness computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Skew {
    /// Regular quartile skewness in [-1, 1]
    Value(f64),
    /// Median coincides with a bound; treated as zero skew
    Degenerate,
}

impl Skew {
    pub fn value(&self) -> f64 {
        match self {
            Self::Value(v) => *v,
            Self::Degenerate => 0.0,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        matches!(self, Self::Degenerate)
    }
}

/// Computes the quartile skewness from three ordered percentiles.
pub fn bowley_skew(low: f64, mid: f64, high: f64) -> Skew {
    if high == low || mid == low || mid == high {
        return Skew::Degenerate;
    }

    let skew = (low + high - 2.0 * mid) / (high - low);
    Skew::Value(skew.clamp(-1.0, 1.0))
}

/// Percentile of an already sorted, non-empty slice. `p` is clamped to
/// [0, 100].
fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let rank = p.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;

    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

/// Linear-interpolation percentile. `None` for an empty slice.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(percentile_sorted(&sorted_copy(values), p))
}

/// Median of the values. `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Median absolute deviation. `None` for an empty slice.
pub fn median_absolute_deviation(values: &[f64]) -> Option<f64> {
    let center = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations)
}

/// Descriptive statistics for a set of intervals, reported alongside the
/// features but not used in the score.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalStatistics {
    pub mean: f64,
    pub std_dev: f64,
    /// Coefficient of variation (σ / μ)
    pub cv: f64,
    pub min: f64,
    pub max: f64,
}

/// Calculates mean, deviation and spread for a set of intervals.
pub fn calculate_statistics(intervals: &[f64]) -> IntervalStatistics {
    let data = Data::new(intervals.to_vec());

    let mean = data.mean().unwrap_or(0.0);
    let std_dev = data.std_dev().unwrap_or(0.0);
    let cv = if mean > 0.0 { std_dev / mean } else { f64::INFINITY };

    IntervalStatistics {
        mean,
        std_dev,
        cv,
        min: data.min(),
        max: data.max(),
    }
}

/// Quartile points of a sorted, non-empty slice.
fn quartiles(sorted: &[f64], points: &PercentilePoints) -> (f64, f64, f64) {
    (
        percentile_sorted(sorted, points.low),
        percentile_sorted(sorted, points.mid),
        percentile_sorted(sorted, points.high),
    )
}

/// Features derived from one conversation's delta series.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    pub low: f64,
    pub mid: f64,
    pub high: f64,
    pub bowley_numerator: f64,
    pub bowley_denominator: f64,
    pub skew: Skew,
    /// Median absolute deviation, seconds
    pub mad: f64,
    /// Seconds between first and last observation, as ordered
    pub span: f64,
    pub intervals: IntervalStatistics,
    /// Bytes-sent features, when the conversation carries sizes
    pub sizes: Option<SizeFeatures>,
}

impl FeatureSet {
    pub fn extract(
        series: &DeltaSeries,
        points: &PercentilePoints,
    ) -> Result<Self, AnalyzerError> {
        let insufficient = || AnalyzerError::InsufficientData {
            required: 1,
            actual: series.len(),
        };

        let sorted = sorted_copy(&series.deltas);
        if sorted.is_empty() {
            return Err(insufficient());
        }
        let (low, mid, high) = quartiles(&sorted, points);
        let mad = median_absolute_deviation(&sorted).ok_or_else(insufficient)?;

        Ok(Self {
            low,
            mid,
            high,
            bowley_numerator: low + high - 2.0 * mid,
            bowley_denominator: high - low,
            skew: bowley_skew(low, mid, high),
            mad,
            span: series.span,
            intervals: calculate_statistics(&series.deltas),
            sizes: None,
        })
    }

    /// Attaches size features computed from the bytes sent per observation.
    pub fn with_sizes(mut self, bytes_sent: &[u64], points: &PercentilePoints) -> Self {
        self.sizes = SizeFeatures::extract(bytes_sent, points);
        self
    }
}

/// Quartile skew and dispersion of the bytes sent per observation.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeFeatures {
    pub low: f64,
    /// Median bytes sent
    pub mid: f64,
    pub high: f64,
    pub skew: Skew,
    /// Median absolute deviation, bytes
    pub mad: f64,
}

impl SizeFeatures {
    /// `None` when no sizes were recorded.
    pub fn extract(bytes_sent: &[u64], points: &PercentilePoints) -> Option<Self> {
        let values: Vec<f64> = bytes_sent.iter().map(|&b| b as f64).collect();
        let sorted = sorted_copy(&values);
        if sorted.is_empty() {
            return None;
        }

        let (low, mid, high) = quartiles(&sorted, points);
        Some(Self {
            low,
            mid,
            high,
            skew: bowley_skew(low, mid, high),
            mad: median_absolute_deviation(&sorted)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(deltas: Vec<f64>) -> DeltaSeries {
        let span = deltas.iter().sum();
        DeltaSeries { deltas, span }
    }

    #[test]
    fn test_percentile_linear_interpolation() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];

        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 50.0), Some(3.0));
        assert_eq!(percentile(&values, 100.0), Some(5.0));
        // rank = 0.2 * 4 = 0.8
        assert!((percentile(&values, 20.0).unwrap() - 1.8).abs() < 1e-12);
        // rank = 0.8 * 4 = 3.2
        assert!((percentile(&values, 80.0).unwrap() - 4.2).abs() < 1e-12);
    }

    #[test]
    fn test_percentile_unsorted_input() {
        let values = vec![10.0, 1.0, 7.0, 3.0];
        // sorted: 1 3 7 10, rank 1.5
        assert_eq!(percentile(&values, 50.0), Some(5.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_median_absolute_deviation() {
        let values = vec![1.0, 1.0, 2.0, 2.0, 4.0, 6.0, 9.0];
        // median 2, deviations 1 1 0 0 2 4 7 → median 1
        assert_eq!(median_absolute_deviation(&values), Some(1.0));
        assert_eq!(median_absolute_deviation(&[]), None);
    }

    #[test]
    fn test_bowley_skew_symmetric() {
        let skew = bowley_skew(10.0, 20.0, 30.0);
        assert_eq!(skew, Skew::Value(0.0));
        assert!(!skew.is_degenerate());
    }

    #[test]
    fn test_bowley_skew_right_tail() {
        // (1 + 100 - 10) / 99
        let skew = bowley_skew(1.0, 5.0, 100.0);
        assert!((skew.value() - 91.0 / 99.0).abs() < 1e-12);
    }

    #[test]
    fn test_bowley_skew_degenerate_guards() {
        assert_eq!(bowley_skew(60.0, 60.0, 60.0), Skew::Degenerate);
        assert_eq!(bowley_skew(10.0, 10.0, 30.0), Skew::Degenerate);
        assert_eq!(bowley_skew(10.0, 30.0, 30.0), Skew::Degenerate);
        assert_eq!(Skew::Degenerate.value(), 0.0);
    }

    #[test]
    fn test_skew_bounded_over_varied_series() {
        let shapes: Vec<Vec<f64>> = vec![
            (1..=50).map(|i| (i as f64).powi(3)).collect(),
            (1..=50).map(|i| -(i as f64).powi(2)).collect(),
            (1..=50).map(|i| if i % 7 == 0 { 3600.0 } else { 1.0 + i as f64 }).collect(),
            (1..=50).map(|i| (i as f64).ln()).collect(),
        ];

        for deltas in shapes {
            let features = FeatureSet::extract(&series(deltas), &PercentilePoints::default()).unwrap();
            let skew = features.skew.value();
            assert!((-1.0..=1.0).contains(&skew), "skew out of range: {}", skew);
        }
    }

    #[test]
    fn test_extract_constant_series() {
        let features =
            FeatureSet::extract(&series(vec![60.0; 99]), &PercentilePoints::default()).unwrap();

        assert_eq!(features.low, 60.0);
        assert_eq!(features.mid, 60.0);
        assert_eq!(features.high, 60.0);
        assert_eq!(features.skew, Skew::Degenerate);
        assert_eq!(features.mad, 0.0);
        assert_eq!(features.bowley_denominator, 0.0);
        assert_eq!(features.intervals.mean, 60.0);
        assert_eq!(features.intervals.cv, 0.0);
        assert_eq!(features.span, 5940.0);
    }

    #[test]
    fn test_extract_matches_helpers() {
        let deltas: Vec<f64> = (0..40).map(|i| 50.0 + ((i * 7) % 21) as f64).collect();
        let features =
            FeatureSet::extract(&series(deltas.clone()), &PercentilePoints::default()).unwrap();

        assert_eq!(Some(features.low), percentile(&deltas, 20.0));
        assert_eq!(Some(features.mid), percentile(&deltas, 50.0));
        assert_eq!(Some(features.high), percentile(&deltas, 80.0));
        assert_eq!(Some(features.mad), median_absolute_deviation(&deltas));
        assert_eq!(
            features.bowley_numerator,
            features.low + features.high - 2.0 * features.mid
        );
    }

    #[test]
    fn test_out_of_range_points_are_clamped() {
        let deltas: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        let points = PercentilePoints {
            low: -5.0,
            mid: 50.0,
            high: 120.0,
        };

        let features = FeatureSet::extract(&series(deltas), &points).unwrap();

        assert_eq!(features.low, 1.0);
        assert_eq!(features.high, 10.0);
    }

    #[test]
    fn test_size_features() {
        let sizes: Vec<u64> = (0..40).map(|i| 500 + (i % 5) * 10).collect();

        let features = SizeFeatures::extract(&sizes, &PercentilePoints::default()).unwrap();

        // sorted: 8 each of 500..540, ranks 7.8 / 19.5 / 31.2
        assert!((features.low - 508.0).abs() < 1e-9);
        assert_eq!(features.mid, 520.0);
        assert!((features.high - 532.0).abs() < 1e-9);
        assert!(features.skew.value().abs() < 1e-9);
        assert_eq!(features.mad, 10.0);
    }

    #[test]
    fn test_size_features_absent() {
        assert!(SizeFeatures::extract(&[], &PercentilePoints::default()).is_none());

        let features = FeatureSet::extract(&series(vec![60.0; 40]), &PercentilePoints::default())
            .unwrap()
            .with_sizes(&[], &PercentilePoints::default());
        assert!(features.sizes.is_none());
    }

    #[test]
    fn test_extract_empty_series() {
        let err = FeatureSet::extract(&series(Vec::new()), &PercentilePoints::default()).unwrap_err();
        assert_eq!(
            err,
            AnalyzerError::InsufficientData {
                required: 1,
                actual: 0
            }
        );
    }

    #[test]
    fn test_custom_percentile_points() {
        let deltas: Vec<f64> = (1..=101).map(|i| i as f64).collect();
        let points = PercentilePoints {
            low: 25.0,
            mid: 50.0,
            high: 75.0,
        };

        let features = FeatureSet::extract(&series(deltas), &points).unwrap();

        assert_eq!(features.low, 26.0);
        assert_eq!(features.mid, 51.0);
        assert_eq!(features.high, 76.0);
    }

    #[test]
    fn test_percentile_points_validation() {
        assert!(PercentilePoints::default().is_valid());
        assert!(!PercentilePoints {
            low: 50.0,
            mid: 50.0,
            high: 80.0
        }
        .is_valid());
        assert!(!PercentilePoints {
            low: 20.0,
            mid: 50.0,
            high: 120.0
        }
        .is_valid());
    }

    #[test]
    fn test_statistics_calculation() {
        let stats = calculate_statistics(&[100.0, 200.0, 300.0, 400.0, 500.0]);

        assert!((stats.mean - 300.0).abs() < 0.01);
        assert!((stats.min - 100.0).abs() < 0.01);
        assert!((stats.max - 500.0).abs() < 0.01);
        assert!(stats.cv > 0.0);
    }
}
