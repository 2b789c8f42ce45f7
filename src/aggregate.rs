//! Conversation aggregation.
//!
//! Groups log records into conversations keyed by (source, destination),
//! optionally refined by port and HTTP method, and drops the ones with too
//! little activity for quartile statistics to mean anything.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ingest::LogRecord;

/// Unique identifier for a conversation.
///
/// Port and method are only set when the log layout provides them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    pub source: String,
    pub destination: String,
    pub port: Option<u16>,
    pub method: Option<String>,
}

impl ConversationKey {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            port: None,
            method: None,
        }
    }

    fn for_record(record: &LogRecord, normalize_case: bool) -> Self {
        let (source, destination) = if normalize_case {
            (record.source.to_lowercase(), record.destination.to_lowercase())
        } else {
            (record.source.clone(), record.destination.clone())
        };

        Self {
            source,
            destination,
            port: record.port,
            method: record.method.clone(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)?;
        if let Some(port) = self.port {
            write!(f, " :{}", port)?;
        }
        if let Some(method) = &self.method {
            write!(f, " {}", method)?;
        }
        Ok(())
    }
}

/// All observations of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub key: ConversationKey,
    /// Observation times in the order the rows were read
    pub timestamps: Vec<DateTime<Utc>>,
    /// Bytes sent per observation, when the log carries sizes
    pub bytes_sent: Vec<u64>,
    /// Bytes received per observation, when the log carries sizes
    pub bytes_received: Vec<u64>,
}

impl Conversation {
    pub fn new(key: ConversationKey, first: DateTime<Utc>) -> Self {
        Self {
            key,
            timestamps: vec![first],
            bytes_sent: Vec::new(),
            bytes_received: Vec::new(),
        }
    }

    fn push_sizes(&mut self, record: &LogRecord) {
        if let Some(sent) = record.bytes_sent {
            self.bytes_sent.push(sent);
        }
        if let Some(received) = record.bytes_received {
            self.bytes_received.push(received);
        }
    }

    /// Keeps the larger sizes when a duplicate observation is folded in.
    fn merge_sizes(&mut self, position: usize, record: &LogRecord) {
        if let (Some(slot), Some(sent)) = (self.bytes_sent.get_mut(position), record.bytes_sent) {
            *slot = (*slot).max(sent);
        }
        if let (Some(slot), Some(received)) =
            (self.bytes_received.get_mut(position), record.bytes_received)
        {
            *slot = (*slot).max(received);
        }
    }

    /// Number of observations.
    pub fn count(&self) -> usize {
        self.timestamps.len()
    }

    /// Time between the first and last observation as ordered.
    pub fn duration(&self) -> chrono::Duration {
        match (self.timestamps.first(), self.timestamps.last()) {
            (Some(first), Some(last)) => last.signed_duration_since(*first),
            _ => chrono::Duration::zero(),
        }
    }
}

/// Configuration for conversation aggregation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregatorConfig {
    /// Conversations need strictly more observations than this
    pub min_activity_threshold: usize,
    /// Lowercase source and destination before grouping
    pub normalize_case: bool,
    /// Ignore repeated timestamps within a conversation
    pub dedupe_timestamps: bool,
    /// Drop destinations reached by more than this many distinct sources
    pub max_sources_per_destination: Option<usize>,
    /// Drop conversations shorter than this many hours
    pub min_duration_hours: Option<f64>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_activity_threshold: 36,
            normalize_case: false,
            dedupe_timestamps: false,
            max_sources_per_destination: None,
            min_duration_hours: None,
        }
    }
}

/// Counters describing one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationStats {
    pub records: usize,
    pub conversations_seen: usize,
    pub duplicates_ignored: usize,
    pub popular_filtered: usize,
    pub below_threshold: usize,
    pub too_short: usize,
    pub retained: usize,
}

/// Groups records into conversations, in first-seen order, and applies the
/// activity filters.
pub fn aggregate(
    records: &[LogRecord],
    config: &AggregatorConfig,
) -> (Vec<Conversation>, AggregationStats) {
    let mut stats = AggregationStats {
        records: records.len(),
        ..AggregationStats::default()
    };

    let mut index: HashMap<ConversationKey, usize> = HashMap::new();
    let mut conversations: Vec<Conversation> = Vec::new();
    // (slot, timestamp) -> position within the conversation
    let mut seen: HashMap<(usize, DateTime<Utc>), usize> = HashMap::new();

    for record in records {
        let key = ConversationKey::for_record(record, config.normalize_case);

        let slot = match index.get(&key) {
            Some(&slot) => {
                let conversation = &mut conversations[slot];
                if config.dedupe_timestamps {
                    if let Some(&position) = seen.get(&(slot, record.timestamp)) {
                        conversation.merge_sizes(position, record);
                        stats.duplicates_ignored += 1;
                        continue;
                    }
                }
                conversation.timestamps.push(record.timestamp);
                conversation.push_sizes(record);
                slot
            }
            None => {
                let slot = conversations.len();
                index.insert(key.clone(), slot);
                let mut conversation = Conversation::new(key, record.timestamp);
                conversation.push_sizes(record);
                conversations.push(conversation);
                slot
            }
        };

        if config.dedupe_timestamps {
            seen.insert((slot, record.timestamp), conversations[slot].count() - 1);
        }
    }

    stats.conversations_seen = conversations.len();

    if let Some(max_sources) = config.max_sources_per_destination {
        let before = conversations.len();
        conversations = remove_popular_destinations(conversations, max_sources);
        stats.popular_filtered = before - conversations.len();
    }

    let threshold = config.min_activity_threshold;
    let min_duration = config.min_duration_hours;

    conversations.retain(|conversation| {
        if conversation.count() <= threshold {
            stats.below_threshold += 1;
            return false;
        }
        if let Some(hours) = min_duration {
            let span_hours = conversation.duration().num_milliseconds() as f64 / 3_600_000.0;
            if span_hours < hours {
                stats.too_short += 1;
                return false;
            }
        }
        true
    });

    stats.retained = conversations.len();

    debug!(
        "Aggregation: {} records, {} conversations, {} popular, {} below threshold, {} too short",
        stats.records,
        stats.conversations_seen,
        stats.popular_filtered,
        stats.below_threshold,
        stats.too_short
    );
    info!(
        "Retained {} of {} conversations for scoring",
        stats.retained, stats.conversations_seen
    );

    (conversations, stats)
}

/// Keeps only conversations whose destination has at most `max_sources`
/// distinct sources.
fn remove_popular_destinations(
    conversations: Vec<Conversation>,
    max_sources: usize,
) -> Vec<Conversation> {
    let mut sources_by_destination: HashMap<String, HashSet<String>> = HashMap::new();
    for conversation in &conversations {
        sources_by_destination
            .entry(conversation.key.destination.clone())
            .or_default()
            .insert(conversation.key.source.clone());
    }

    conversations
        .into_iter()
        .filter(|conversation| {
            sources_by_destination
                .get(&conversation.key.destination)
                .map(|sources| sources.len() <= max_sources)
                .unwrap_or(true)
        })
        .collect()
}
