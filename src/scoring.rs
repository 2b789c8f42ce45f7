//! Beacon scoring.
//!
//! Three bounded sub-scores are derived from a conversation's features:
//!
//! - **skew score** = 1 − |skew|: symmetric delta distributions look automated
//! - **dispersion score** = max(0, 1 − MAD / normalizer): low jitter looks automated
//! - **rate score** = min(1, numerator · count / (span / window)): frequent,
//!   sustained check-ins look automated
//!
//! A [`ScoreCombiner`] folds them into the time score.
//!
//! When transfer sizes are available, a data score is derived from the bytes
//! sent per observation:
//!
//! - **size skew score** = 1 − |size skew|
//! - **size dispersion score** = max(0, 1 − size MAD / normalizer)
//! - **smallness score** = max(0, 1 − median bytes / normalizer): small,
//!   uniform payloads look like check-ins
//!
//! The final score blends time and data scores by `time_weight` and
//! `data_weight`. With the default data weight of zero it equals the time
//! score.

use serde::{Deserialize, Serialize};

use crate::aggregate::ConversationKey;
use crate::error::AnalyzerError;
use crate::features::{FeatureSet, PercentilePoints, SizeFeatures, Skew};

/// Relative weights for [`WeightedMean`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoreWeights {
    pub skew: f64,
    pub dispersion: f64,
    pub rate: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            skew: 1.0,
            dispersion: 1.0,
            rate: 1.0,
        }
    }
}

/// Tunables for feature extraction and scoring.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringParams {
    /// MAD (seconds) at which the dispersion score reaches zero
    pub dispersion_normalizer: f64,
    /// Scaling constant of the rate score
    pub rate_numerator: f64,
    /// Span is measured in units of this many seconds for the rate score
    pub rate_window_secs: f64,
    pub percentiles: PercentilePoints,
    /// Weighted combination; unweighted mean when absent
    pub weights: Option<ScoreWeights>,
    /// Weight of the time score in the final blend
    pub time_weight: f64,
    /// Weight of the data score in the final blend; 0 ignores sizes
    pub data_weight: f64,
    /// Size MAD (bytes) at which the size dispersion score reaches zero
    pub size_dispersion_normalizer: f64,
    /// Median bytes sent at which the smallness score reaches zero
    pub smallness_normalizer: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            dispersion_normalizer: 30.0,
            rate_numerator: 10.0,
            rate_window_secs: 1.0,
            percentiles: PercentilePoints::default(),
            weights: None,
            time_weight: 1.0,
            data_weight: 0.0,
            size_dispersion_normalizer: 128.0,
            smallness_normalizer: 8192.0,
        }
    }
}

/// Outcome of the rate computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    /// Capped rate score
    Value(f64),
    /// All observations at the same instant
    ZeroSpan,
}

/// Sub-scores of the bytes sent per observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataScores {
    pub skew_score: f64,
    pub dispersion_score: f64,
    pub smallness_score: f64,
    /// Mean of the three data sub-scores
    pub score: f64,
}

impl DataScores {
    pub fn from_features(sizes: &SizeFeatures, params: &ScoringParams) -> Self {
        let skew = skew_score(sizes.skew);
        let dispersion = dispersion_score(sizes.mad, params.size_dispersion_normalizer);
        let smallness = smallness_score(sizes.mid, params.smallness_normalizer);

        Self {
            skew_score: skew,
            dispersion_score: dispersion,
            smallness_score: smallness,
            score: (skew + dispersion + smallness) / 3.0,
        }
    }
}

/// Sub-scores and composite score of one conversation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreSet {
    pub skew_score: f64,
    pub dispersion_score: f64,
    pub rate_score: f64,
    /// Combined timing score
    pub time_score: f64,
    /// Present when the conversation carries transfer sizes
    pub data: Option<DataScores>,
    /// Final score
    pub score: f64,
}

impl ScoreSet {
    /// Score rounded to three decimals for display.
    pub fn rounded(&self) -> f64 {
        (self.score * 1000.0).round() / 1000.0
    }
}

pub fn skew_score(skew: Skew) -> f64 {
    1.0 - skew.value().abs()
}

pub fn dispersion_score(mad: f64, normalizer: f64) -> f64 {
    (1.0 - mad / normalizer).max(0.0)
}

pub fn smallness_score(median_bytes: f64, normalizer: f64) -> f64 {
    (1.0 - median_bytes / normalizer).max(0.0)
}

/// Blends the time and data scores. Falls back to the time score when there
/// is no data score or the data weight is zero.
pub fn blend(time_score: f64, data_score: Option<f64>, params: &ScoringParams) -> f64 {
    match data_score {
        Some(data) if params.data_weight > 0.0 => {
            let total = params.time_weight + params.data_weight;
            (params.time_weight * time_score + params.data_weight * data) / total
        }
        _ => time_score,
    }
}

pub fn rate_score(count: usize, span: f64, params: &ScoringParams) -> Rate {
    if span == 0.0 {
        return Rate::ZeroSpan;
    }

    let windows = span / params.rate_window_secs;
    Rate::Value((params.rate_numerator * count as f64 / windows).min(1.0))
}

/// Strategy for folding the three sub-scores into one.
pub trait ScoreCombiner: Send + Sync {
    fn combine(&self, skew_score: f64, dispersion_score: f64, rate_score: f64) -> f64;

    fn name(&self) -> &'static str;
}

/// Plain average of the three sub-scores.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnweightedMean;

impl ScoreCombiner for UnweightedMean {
    fn combine(&self, skew_score: f64, dispersion_score: f64, rate_score: f64) -> f64 {
        (skew_score + dispersion_score + rate_score) / 3.0
    }

    fn name(&self) -> &'static str {
        "unweighted_mean"
    }
}

/// Weighted average of the three sub-scores.
#[derive(Debug, Clone, Copy)]
pub struct WeightedMean {
    pub weights: ScoreWeights,
}

impl ScoreCombiner for WeightedMean {
    fn combine(&self, skew_score: f64, dispersion_score: f64, rate_score: f64) -> f64 {
        let w = &self.weights;
        let total = w.skew + w.dispersion + w.rate;
        if total <= 0.0 {
            return 0.0;
        }
        (w.skew * skew_score + w.dispersion * dispersion_score + w.rate * rate_score) / total
    }

    fn name(&self) -> &'static str {
        "weighted_mean"
    }
}

/// Scores conversations from their features.
pub struct BeaconScorer {
    params: ScoringParams,
    combiner: Box<dyn ScoreCombiner>,
}

impl BeaconScorer {
    pub fn new(params: ScoringParams) -> Self {
        let combiner: Box<dyn ScoreCombiner> = match params.weights {
            Some(weights) => Box::new(WeightedMean { weights }),
            None => Box::new(UnweightedMean),
        };
        Self { params, combiner }
    }

    pub fn with_combiner(params: ScoringParams, combiner: Box<dyn ScoreCombiner>) -> Self {
        Self { params, combiner }
    }

    pub fn params(&self) -> &ScoringParams {
        &self.params
    }

    pub fn combiner_name(&self) -> &'static str {
        self.combiner.name()
    }

    /// Scores one conversation. Fails with [`AnalyzerError::ZeroSpan`] when
    /// the conversation has no elapsed time.
    pub fn score(
        &self,
        key: &ConversationKey,
        count: usize,
        features: &FeatureSet,
    ) -> Result<ScoreSet, AnalyzerError> {
        let rate = match rate_score(count, features.span, &self.params) {
            Rate::Value(v) => v,
            Rate::ZeroSpan => {
                return Err(AnalyzerError::ZeroSpan {
                    src: key.source.clone(),
                    dst: key.destination.clone(),
                    count,
                })
            }
        };

        let skew = skew_score(features.skew);
        let dispersion = dispersion_score(features.mad, self.params.dispersion_normalizer);
        let time_score = self.combiner.combine(skew, dispersion, rate);

        let data = features
            .sizes
            .as_ref()
            .map(|sizes| DataScores::from_features(sizes, &self.params));

        Ok(ScoreSet {
            skew_score: skew,
            dispersion_score: dispersion,
            rate_score: rate,
            time_score,
            data,
            score: blend(time_score, data.map(|d| d.score), &self.params),
        })
    }
}

impl Default for BeaconScorer {
    fn default() -> Self {
        Self::new(ScoringParams::default())
    }
}
