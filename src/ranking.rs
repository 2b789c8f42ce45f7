//! Ranking and classification of scored conversations.
//!
//! Ranking never drops a conversation: the beacon flag is an annotation so a
//! consumer can move the threshold without rescoring.

use crate::aggregate::ConversationKey;
use crate::features::FeatureSet;
use crate::scoring::ScoreSet;

/// A conversation with its derived features and scores.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredConversation {
    pub key: ConversationKey,
    pub count: usize,
    pub deltas: Vec<f64>,
    pub features: FeatureSet,
    pub scores: ScoreSet,
}

impl ScoredConversation {
    /// Session length in hours, from the first to the last observation.
    pub fn duration_hours(&self) -> f64 {
        self.features.span / 3600.0
    }
}

/// Classification of a ranked conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Score above the beacon threshold
    PossibleBeacon,
    /// Score at or below the threshold
    Unremarkable,
}

impl Verdict {
    pub fn from_score(score: f64, threshold: f64) -> Self {
        if score > threshold {
            Self::PossibleBeacon
        } else {
            Self::Unremarkable
        }
    }

    /// Returns a short label for tables.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PossibleBeacon => "BEACON",
            Self::Unremarkable => "-",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PossibleBeacon => write!(f, "Possible Beacon"),
            Self::Unremarkable => write!(f, "Unremarkable"),
        }
    }
}

/// A scored conversation in its final position.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedConversation {
    /// 1-based position, highest score first
    pub rank: usize,
    pub verdict: Verdict,
    pub conversation: ScoredConversation,
}

impl RankedConversation {
    pub fn is_beacon(&self) -> bool {
        self.verdict == Verdict::PossibleBeacon
    }

    pub fn score(&self) -> f64 {
        self.conversation.scores.score
    }
}

/// Sorts by score descending and flags conversations above `threshold`.
///
/// The sort is stable, so equal scores keep their incoming order.
pub fn rank(mut scored: Vec<ScoredConversation>, threshold: f64) -> Vec<RankedConversation> {
    scored.sort_by(|a, b| b.scores.score.total_cmp(&a.scores.score));

    scored
        .into_iter()
        .enumerate()
        .map(|(index, conversation)| RankedConversation {
            rank: index + 1,
            verdict: Verdict::from_score(conversation.scores.score, threshold),
            conversation,
        })
        .collect()
}
