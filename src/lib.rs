//! Beacon-Finder: C2 beacon detection over proxy and DNS logs.
//!
//! Conversations between a source and a destination are scored on how
//! machine-like their check-in intervals look: a symmetric interval
//! distribution, low jitter and a sustained request rate.
//!
//! # Pipeline
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────┐   ┌──────────┐   ┌─────────┐   ┌─────────┐
//! │  Ingest  │──>│ Aggregate │──>│ Deltas │──>│ Features │──>│ Scoring │──>│ Ranking │
//! │ (rows)   │   │ (src,dst) │   │        │   │ skew/MAD │   │         │   │         │
//! └──────────┘   └───────────┘   └────────┘   └──────────┘   └─────────┘   └─────────┘
//! ```

pub mod aggregate;
pub mod analyzer;
pub mod config;
pub mod deltas;
pub mod error;
pub mod export;
pub mod features;
pub mod ingest;
pub mod ranking;
pub mod scoring;

pub use aggregate::{aggregate, AggregatorConfig, Conversation, ConversationKey};
pub use analyzer::{AnalysisReport, AnalyzerConfig, BeaconAnalyzer};
pub use config::Config;
pub use deltas::{DeltaOrdering, DeltaSeries};
pub use error::{AnalyzerError, IngestError};
pub use features::{FeatureSet, PercentilePoints, SizeFeatures, Skew};
pub use ingest::{read_log_file, IngestConfig, LogPreset, LogRecord};
pub use ranking::{rank, RankedConversation, ScoredConversation, Verdict};
pub use scoring::{BeaconScorer, DataScores, ScoreCombiner, ScoreSet, ScoringParams};
