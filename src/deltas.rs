//! Temporal delta analysis.
//!
//! For a series of timestamps [t₀, t₁, ..., tₙ] the inter-arrival deltas are
//! Δᵢ = tᵢ₊₁ - tᵢ, in seconds, and the span is tₙ - t₀.
//!
//! # Ordering contract
//!
//! With [`DeltaOrdering::AsObserved`] timestamps are differenced exactly in
//! the order they were read. A log that is not chronological per
//! conversation then yields negative deltas and possibly a negative span;
//! both are propagated unchanged. [`DeltaOrdering::Chronological`] sorts each
//! conversation's timestamps before differencing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How timestamps are ordered before differencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOrdering {
    /// Row order, as ingested
    #[default]
    AsObserved,
    /// Sorted ascending by time
    Chronological,
}

impl std::fmt::Display for DeltaOrdering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AsObserved => write!(f, "as_observed"),
            Self::Chronological => write!(f, "chronological"),
        }
    }
}

/// Inter-arrival deltas of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaSeries {
    /// Seconds between consecutive observations, length `count - 1`
    pub deltas: Vec<f64>,
    /// Seconds between the last and first observation, signed
    pub span: f64,
}

impl DeltaSeries {
    pub fn from_timestamps(timestamps: &[DateTime<Utc>], ordering: DeltaOrdering) -> Self {
        match ordering {
            DeltaOrdering::AsObserved => Self {
                deltas: timestamps_to_deltas(timestamps),
                span: span_secs(timestamps),
            },
            DeltaOrdering::Chronological => {
                let mut sorted = timestamps.to_vec();
                sorted.sort();
                Self {
                    deltas: timestamps_to_deltas(&sorted),
                    span: span_secs(&sorted),
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// True when the source series was not chronological.
    pub fn has_negative(&self) -> bool {
        self.deltas.iter().any(|d| *d < 0.0)
    }
}

/// Converts timestamps to interval deltas in seconds.
pub fn timestamps_to_deltas(timestamps: &[DateTime<Utc>]) -> Vec<f64> {
    if timestamps.len() < 2 {
        return Vec::new();
    }

    timestamps
        .windows(2)
        .map(|window| duration_secs(window[1].signed_duration_since(window[0])))
        .collect()
}

/// Seconds between the last and first timestamp (0 for fewer than two).
pub fn span_secs(timestamps: &[DateTime<Utc>]) -> f64 {
    match (timestamps.first(), timestamps.last()) {
        (Some(first), Some(last)) => duration_secs(last.signed_duration_since(*first)),
        _ => 0.0,
    }
}

fn duration_secs(delta: chrono::Duration) -> f64 {
    // Microsecond precision covers ~292k years before overflowing
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}
