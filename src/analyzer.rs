//! Beacon analysis pipeline.
//!
//! Drives a closed batch of log records through every stage:
//!
//! ```text
//! records ──> aggregate ──> deltas ──> features ──> scores ──> rank
//!             (fold)        └──── per conversation, parallel ────┘
//! ```
//!
//! Aggregation is a single-threaded fold. Every later stage depends only on
//! one conversation, so [`BeaconAnalyzer::run_parallel`] fans conversations
//! out to blocking workers and gathers them back in their original order;
//! the result is identical to [`BeaconAnalyzer::run`].

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, AggregationStats, AggregatorConfig, Conversation};
use crate::deltas::{DeltaOrdering, DeltaSeries};
use crate::error::{AnalyzerError, Result};
use crate::features::FeatureSet;
use crate::ingest::{IngestStats, LogRecord};
use crate::ranking::{rank, RankedConversation, ScoredConversation};
use crate::scoring::{BeaconScorer, ScoringParams};

/// Configuration for the scoring stages.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerConfig {
    /// Timestamp ordering applied before differencing
    pub ordering: DeltaOrdering,
    /// Conversations scoring strictly above this are flagged
    pub beacon_threshold: f64,
    /// Worker count for parallel scoring
    pub workers: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            ordering: DeltaOrdering::AsObserved,
            beacon_threshold: 0.7,
            workers: 4,
        }
    }
}

/// Result of one analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub timestamp: DateTime<Utc>,
    pub beacon_threshold: f64,
    pub ingest: Option<IngestStats>,
    pub aggregation: AggregationStats,
    /// Every scored conversation, highest score first
    pub ranked: Vec<RankedConversation>,
    /// Conversations excluded because they could not be scored
    pub warnings: Vec<AnalyzerError>,
}

impl AnalysisReport {
    /// Conversations above the beacon threshold, in rank order.
    pub fn flagged(&self) -> impl Iterator<Item = &RankedConversation> {
        self.ranked.iter().filter(|r| r.is_beacon())
    }

    pub fn flagged_count(&self) -> usize {
        self.flagged().count()
    }
}

/// Runs the full pipeline over a batch of records.
pub struct BeaconAnalyzer {
    aggregation: AggregatorConfig,
    config: AnalyzerConfig,
    scorer: Arc<BeaconScorer>,
}

impl BeaconAnalyzer {
    pub fn new(aggregation: AggregatorConfig, config: AnalyzerConfig, scoring: ScoringParams) -> Self {
        Self::with_scorer(aggregation, config, BeaconScorer::new(scoring))
    }

    pub fn with_scorer(
        aggregation: AggregatorConfig,
        config: AnalyzerConfig,
        scorer: BeaconScorer,
    ) -> Self {
        Self {
            aggregation,
            config,
            scorer: Arc::new(scorer),
        }
    }

    /// Analyzes the records on the calling thread.
    pub fn run(&self, records: &[LogRecord]) -> AnalysisReport {
        let (conversations, stats) = aggregate(records, &self.aggregation);
        info!(
            "Scoring {} conversations ({} combiner)",
            conversations.len(),
            self.scorer.combiner_name()
        );

        let outcomes = conversations
            .into_iter()
            .map(|c| score_conversation(c, self.config.ordering, &self.scorer))
            .collect();

        self.finish(stats, outcomes)
    }

    /// Analyzes the records, scoring conversations on blocking worker threads.
    pub async fn run_parallel(&self, records: &[LogRecord]) -> Result<AnalysisReport> {
        let (conversations, stats) = aggregate(records, &self.aggregation);
        let workers = self.config.workers.max(1);
        let chunk_size = conversations.len().div_ceil(workers).max(1);

        info!(
            "Scoring {} conversations on {} workers ({} combiner)",
            conversations.len(),
            workers,
            self.scorer.combiner_name()
        );

        let mut handles = Vec::with_capacity(workers);
        let mut remaining = conversations.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<Conversation> = remaining.by_ref().take(chunk_size).collect();
            let scorer = Arc::clone(&self.scorer);
            let ordering = self.config.ordering;

            handles.push(tokio::task::spawn_blocking(move || {
                chunk
                    .into_iter()
                    .map(|c| score_conversation(c, ordering, &scorer))
                    .collect::<Vec<_>>()
            }));
        }

        // Awaiting in spawn order keeps the original conversation order
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.extend(handle.await.context("Scoring worker failed")?);
        }

        Ok(self.finish(stats, outcomes))
    }

    fn finish(
        &self,
        stats: AggregationStats,
        outcomes: Vec<std::result::Result<ScoredConversation, AnalyzerError>>,
    ) -> AnalysisReport {
        let mut scored = Vec::with_capacity(outcomes.len());
        let mut warnings = Vec::new();

        for outcome in outcomes {
            match outcome {
                Ok(conversation) => scored.push(conversation),
                Err(e) => {
                    warn!("Excluding conversation: {}", e);
                    warnings.push(e);
                }
            }
        }

        let ranked = rank(scored, self.config.beacon_threshold);
        let report = AnalysisReport {
            timestamp: Utc::now(),
            beacon_threshold: self.config.beacon_threshold,
            ingest: None,
            aggregation: stats,
            ranked,
            warnings,
        };

        info!(
            "Analysis complete: {} ranked, {} possible beacons, {} excluded",
            report.ranked.len(),
            report.flagged_count(),
            report.warnings.len()
        );

        report
    }
}

/// Runs the delta, feature and scoring stages for one conversation.
pub fn score_conversation(
    conversation: Conversation,
    ordering: DeltaOrdering,
    scorer: &BeaconScorer,
) -> std::result::Result<ScoredConversation, AnalyzerError> {
    let count = conversation.count();
    let series = DeltaSeries::from_timestamps(&conversation.timestamps, ordering);
    if series.has_negative() {
        debug!(
            "{}: timestamps are not chronological, deltas include negative values",
            conversation.key
        );
    }

    let points = &scorer.params().percentiles;
    let features =
        FeatureSet::extract(&series, points)?.with_sizes(&conversation.bytes_sent, points);
    let scores = scorer.score(&conversation.key, count, &features)?;

    debug!(
        "{}: count={} skew={:.4} mad={:.2}s span={:.0}s score={:.3}",
        conversation.key,
        count,
        features.skew.value(),
        features.mad,
        features.span,
        scores.score
    );

    Ok(ScoredConversation {
        key: conversation.key,
        count,
        deltas: series.deltas,
        features,
        scores,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Skew;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_677_790_707, 0).unwrap()
    }

    fn records_from_offsets(source: &str, destination: &str, offsets: &[f64]) -> Vec<LogRecord> {
        offsets
            .iter()
            .map(|secs| {
                let ts = start() + chrono::Duration::milliseconds((secs * 1000.0).round() as i64);
                LogRecord::new(ts, source, destination)
            })
            .collect()
    }

    /// 100 observations exactly 60 seconds apart.
    fn perfect_beacon() -> Vec<LogRecord> {
        let offsets: Vec<f64> = (0..100).map(|i| i as f64 * 60.0).collect();
        records_from_offsets("user7", "itsabeacon.com", &offsets)
    }

    /// 50 observations with gaps growing geometrically from 1s to 3600s.
    fn human_browsing() -> Vec<LogRecord> {
        let mut offsets = vec![0.0];
        for i in 0..49 {
            let gap = 3600f64.powf(i as f64 / 48.0);
            offsets.push(offsets[i] + gap);
        }
        records_from_offsets("user3", "news.example.com", &offsets)
    }

    /// One check-in every 60s ± uniform [-10, 10]s jitter for 8 hours.
    fn jittered_beacon(seed: u64) -> Vec<LogRecord> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut offsets = Vec::new();
        let mut t = 0.0;
        while t < 8.0 * 3600.0 {
            offsets.push(t);
            t += 60.0 + rng.gen_range(-10..=10) as f64;
        }
        records_from_offsets("user9", "cdn-update.net", &offsets)
    }

    fn analyzer() -> BeaconAnalyzer {
        BeaconAnalyzer::new(
            AggregatorConfig::default(),
            AnalyzerConfig::default(),
            ScoringParams::default(),
        )
    }

    fn find<'a>(report: &'a AnalysisReport, destination: &str) -> &'a RankedConversation {
        report
            .ranked
            .iter()
            .find(|r| r.conversation.key.destination == destination)
            .unwrap()
    }

    #[test]
    fn test_perfect_beacon_is_flagged() {
        let report = analyzer().run(&perfect_beacon());
        let beacon = find(&report, "itsabeacon.com");
        let features = &beacon.conversation.features;

        assert_eq!(features.skew, Skew::Degenerate);
        assert_eq!(features.mad, 0.0);
        assert_eq!(features.span, 5940.0);
        assert!((beacon.conversation.scores.rate_score - 1000.0 / 5940.0).abs() < 1e-12);
        assert!(beacon.score() > 0.7);
        assert!(beacon.is_beacon());
        assert_eq!(report.flagged_count(), 1);
    }

    #[test]
    fn test_human_browsing_is_not_flagged() {
        let report = analyzer().run(&human_browsing());
        let human = find(&report, "news.example.com");

        assert_eq!(human.conversation.count, 50);
        assert!(human.conversation.features.skew.value().abs() > 0.3);
        assert!(human.score() < 0.7);
        assert_eq!(report.flagged_count(), 0);
    }

    #[test]
    fn test_jittered_beacon_features() {
        let report = analyzer().run(&jittered_beacon(7));
        let beacon = find(&report, "cdn-update.net");
        let features = &beacon.conversation.features;

        assert!(features.mad <= 6.0, "mad = {}", features.mad);
        assert!(features.skew.value().abs() < 0.5);
        assert!(beacon.conversation.scores.dispersion_score >= 0.8);
        // A one-minute beacon checks in about once per 60 seconds
        assert!((beacon.conversation.scores.rate_score - 10.0 / 60.0).abs() < 0.02);
    }

    #[test]
    fn test_jittered_beacon_flagged_with_rate_window() {
        let scoring = ScoringParams {
            rate_window_secs: 90.0,
            ..ScoringParams::default()
        };
        let analyzer = BeaconAnalyzer::new(
            AggregatorConfig::default(),
            AnalyzerConfig::default(),
            scoring,
        );

        let mut records = jittered_beacon(11);
        records.extend(human_browsing());
        let report = analyzer.run(&records);

        let beacon = find(&report, "cdn-update.net");
        assert_eq!(beacon.conversation.scores.rate_score, 1.0);
        assert!(beacon.score() > 0.7, "score = {}", beacon.score());
        assert!(beacon.is_beacon());
        assert!(!find(&report, "news.example.com").is_beacon());
    }

    #[test]
    fn test_mixed_traffic_ranking() {
        let mut records = Vec::new();
        records.extend(human_browsing());
        records.extend(jittered_beacon(3));
        records.extend(perfect_beacon());
        // Below the activity threshold
        records.extend(records_from_offsets("user1", "rare.org", &[0.0, 30.0, 90.0]));

        let report = analyzer().run(&records);

        assert_eq!(report.ranked.len(), 3);
        assert_eq!(report.aggregation.below_threshold, 1);
        assert_eq!(report.ranked[0].conversation.key.destination, "itsabeacon.com");
        assert_eq!(report.ranked[2].conversation.key.destination, "news.example.com");

        let flagged: Vec<_> = report
            .flagged()
            .map(|r| r.conversation.key.destination.as_str())
            .collect();
        assert_eq!(flagged, vec!["itsabeacon.com"]);
    }

    #[test]
    fn test_zero_span_conversation_is_excluded() {
        let mut records = perfect_beacon();
        // Replayed rows: 40 observations at the same instant
        records.extend(records_from_offsets("user2", "replay.net", &[120.0; 40]));

        let report = analyzer().run(&records);

        assert_eq!(report.ranked.len(), 1);
        assert_eq!(
            report.warnings,
            vec![AnalyzerError::ZeroSpan {
                src: "user2".into(),
                dst: "replay.net".into(),
                count: 40,
            }]
        );
        assert!(find(&report, "itsabeacon.com").is_beacon());
    }

    #[test]
    fn test_score_bounded_across_scenarios() {
        let mut records = Vec::new();
        records.extend(human_browsing());
        records.extend(jittered_beacon(5));
        records.extend(perfect_beacon());

        let report = analyzer().run(&records);

        for ranked in &report.ranked {
            let scores = &ranked.conversation.scores;
            for value in [scores.skew_score, scores.dispersion_score, scores.rate_score, scores.score] {
                assert!((0.0..=1.0).contains(&value), "{} out of range", value);
            }
        }
    }

    #[test]
    fn test_rerun_is_identical() {
        let mut records = Vec::new();
        records.extend(jittered_beacon(21));
        records.extend(human_browsing());
        records.extend(perfect_beacon());

        let analyzer = analyzer();
        let first = analyzer.run(&records);
        let second = analyzer.run(&records);

        assert_eq!(first.ranked, second.ranked);
    }

    #[test]
    fn test_out_of_order_rows_propagate_negative_span() {
        let mut offsets: Vec<f64> = (0..40).map(|i| i as f64 * 60.0).collect();
        offsets.reverse();
        let records = records_from_offsets("user4", "reversed.net", &offsets);

        let report = analyzer().run(&records);
        let features = &find(&report, "reversed.net").conversation.features;
        assert_eq!(features.span, -2340.0);

        let chronological = BeaconAnalyzer::new(
            AggregatorConfig::default(),
            AnalyzerConfig {
                ordering: DeltaOrdering::Chronological,
                ..AnalyzerConfig::default()
            },
            ScoringParams::default(),
        );
        let report = chronological.run(&records);
        let features = &find(&report, "reversed.net").conversation.features;
        assert_eq!(features.span, 2340.0);
        assert_eq!(features.mid, 60.0);
    }

    #[test]
    fn test_lowered_threshold_surfaces_insufficient_data() {
        let aggregation = AggregatorConfig {
            min_activity_threshold: 0,
            ..AggregatorConfig::default()
        };
        let analyzer = BeaconAnalyzer::new(
            aggregation,
            AnalyzerConfig::default(),
            ScoringParams::default(),
        );

        let report = analyzer.run(&records_from_offsets("user1", "once.com", &[0.0]));

        assert!(report.ranked.is_empty());
        assert!(matches!(
            report.warnings[0],
            AnalyzerError::InsufficientData { .. }
        ));
    }

    #[test]
    fn test_ports_score_separately() {
        let mut records: Vec<LogRecord> = perfect_beacon()
            .into_iter()
            .map(|r| r.with_port(443))
            .collect();
        records.extend(
            records_from_offsets("user7", "itsabeacon.com", &[30.0, 95.0, 4000.0])
                .into_iter()
                .map(|r| r.with_port(80)),
        );

        let report = analyzer().run(&records);

        assert_eq!(report.aggregation.conversations_seen, 2);
        assert_eq!(report.ranked.len(), 1);
        assert_eq!(report.ranked[0].conversation.key.port, Some(443));
        assert!(report.ranked[0].is_beacon());
    }

    #[test]
    fn test_data_weight_uses_sizes() {
        let records: Vec<LogRecord> = perfect_beacon()
            .into_iter()
            .map(|r| r.with_bytes(256, 1024))
            .collect();

        let default_report = analyzer().run(&records);
        let default_scores = &default_report.ranked[0].conversation.scores;
        assert!(default_scores.data.is_some());
        assert_eq!(default_scores.score, default_scores.time_score);

        let weighted = BeaconAnalyzer::new(
            AggregatorConfig::default(),
            AnalyzerConfig::default(),
            ScoringParams {
                data_weight: 1.0,
                ..ScoringParams::default()
            },
        );
        let report = weighted.run(&records);
        let scores = &report.ranked[0].conversation.scores;

        assert!(scores.score > default_scores.score);
        assert!(scores.score <= 1.0);
    }

    #[tokio::test]
    async fn test_parallel_matches_sequential() {
        let mut records = Vec::new();
        for seed in 0..6 {
            let source = format!("host{}", seed);
            records.extend(jittered_beacon(seed).into_iter().map(|mut r| {
                r.source = source.clone();
                r
            }));
        }
        records.extend(human_browsing());
        records.extend(perfect_beacon());
        records.extend(records_from_offsets("user2", "replay.net", &[10.0; 40]));

        let analyzer = BeaconAnalyzer::new(
            AggregatorConfig::default(),
            AnalyzerConfig {
                workers: 3,
                ..AnalyzerConfig::default()
            },
            ScoringParams::default(),
        );

        let sequential = analyzer.run(&records);
        let parallel = analyzer.run_parallel(&records).await.unwrap();

        assert_eq!(sequential.ranked, parallel.ranked);
        assert_eq!(sequential.warnings, parallel.warnings);
        assert_eq!(parallel.ranked.len(), 8);
    }

    #[tokio::test]
    async fn test_parallel_empty_input() {
        let report = analyzer().run_parallel(&[]).await.unwrap();
        assert!(report.ranked.is_empty());
        assert!(report.warnings.is_empty());
    }
}
