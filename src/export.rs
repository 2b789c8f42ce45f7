//! Export Module
//!
//! Renders analysis reports as text tables, JSON or JSON Lines for
//! integration with other security tools.

use serde::{Deserialize, Serialize};

use crate::analyzer::AnalysisReport;
use crate::error::AnalyzerError;
use crate::aggregate::ConversationKey;
use crate::ranking::RankedConversation;
use crate::scoring::DataScores;

/// Output format for exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    #[serde(rename = "jsonl", alias = "jsonlines")]
    JsonLines, // One JSON object per line (JSONL)
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "jsonl" | "jsonlines" => Ok(Self::JsonLines),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::JsonLines => write!(f, "jsonl"),
        }
    }
}

/// JSON-serializable analysis report
#[derive(Serialize)]
pub struct JsonReport {
    pub version: &'static str,
    pub timestamp: String,
    pub beacon_threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<usize>,
    pub conversations_seen: usize,
    pub conversations_scored: usize,
    pub flagged_count: usize,
    pub conversations: Vec<JsonConversation>,
    pub possible_beacons: Vec<String>,
    pub warnings: Vec<JsonWarning>,
}

impl JsonReport {
    pub fn new(report: &AnalysisReport, flagged_only: bool) -> Self {
        Self {
            version: "1.0",
            timestamp: report.timestamp.to_rfc3339(),
            beacon_threshold: report.beacon_threshold,
            records: report.ingest.as_ref().map(|s| s.records_accepted),
            conversations_seen: report.aggregation.conversations_seen,
            conversations_scored: report.ranked.len(),
            flagged_count: report.flagged_count(),
            conversations: selected(report, flagged_only)
                .map(JsonConversation::from)
                .collect(),
            possible_beacons: report
                .flagged()
                .map(|r| r.conversation.key.to_string())
                .collect(),
            warnings: report.warnings.iter().map(JsonWarning::from).collect(),
        }
    }
}

/// JSON-serializable ranked conversation
#[derive(Serialize)]
pub struct JsonConversation {
    pub rank: usize,
    pub score: f64,
    pub is_beacon: bool,
    pub count: usize,
    pub source: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub duration_hours: f64,
    pub time_score: f64,
    pub skew_score: f64,
    pub dispersion_score: f64,
    pub rate_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonDataScores>,
    pub skew: f64,
    pub skew_degenerate: bool,
    pub mad_secs: f64,
    pub span_secs: f64,
    pub percentiles: [f64; 3],
    pub mean_interval_secs: f64,
    pub std_dev_secs: f64,
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cv: Option<f64>,
    pub deltas: Vec<f64>,
}

/// JSON-serializable transfer size scores
#[derive(Serialize)]
pub struct JsonDataScores {
    pub score: f64,
    pub skew_score: f64,
    pub dispersion_score: f64,
    pub smallness_score: f64,
    pub median_bytes_sent: f64,
    pub mad_bytes_sent: f64,
}

impl From<&RankedConversation> for JsonConversation {
    fn from(ranked: &RankedConversation) -> Self {
        let conversation = &ranked.conversation;
        let features = &conversation.features;
        let scores = &conversation.scores;
        let data = scores
            .data
            .zip(features.sizes.as_ref())
            .map(|(data, sizes)| JsonDataScores {
                score: data.score,
                skew_score: data.skew_score,
                dispersion_score: data.dispersion_score,
                smallness_score: data.smallness_score,
                median_bytes_sent: sizes.mid,
                mad_bytes_sent: sizes.mad,
            });

        Self {
            rank: ranked.rank,
            score: scores.rounded(),
            is_beacon: ranked.is_beacon(),
            count: conversation.count,
            source: conversation.key.source.clone(),
            destination: conversation.key.destination.clone(),
            port: conversation.key.port,
            method: conversation.key.method.clone(),
            duration_hours: conversation.duration_hours(),
            time_score: scores.time_score,
            skew_score: scores.skew_score,
            dispersion_score: scores.dispersion_score,
            rate_score: scores.rate_score,
            data,
            skew: features.skew.value(),
            skew_degenerate: features.skew.is_degenerate(),
            mad_secs: features.mad,
            span_secs: features.span,
            percentiles: [features.low, features.mid, features.high],
            mean_interval_secs: features.intervals.mean,
            std_dev_secs: features.intervals.std_dev,
            min_interval_secs: features.intervals.min,
            max_interval_secs: features.intervals.max,
            // JSON has no representation for infinity
            cv: Some(features.intervals.cv).filter(|cv| cv.is_finite()),
            deltas: conversation.deltas.clone(),
        }
    }
}

/// JSON-serializable pipeline warning
#[derive(Serialize)]
pub struct JsonWarning {
    pub kind: &'static str,
    pub message: String,
}

impl From<&AnalyzerError> for JsonWarning {
    fn from(error: &AnalyzerError) -> Self {
        let kind = match error {
            AnalyzerError::ZeroSpan { .. } => "zero_span",
            AnalyzerError::InsufficientData { .. } => "insufficient_data",
        };
        Self {
            kind,
            message: error.to_string(),
        }
    }
}

fn selected(
    report: &AnalysisReport,
    flagged_only: bool,
) -> impl Iterator<Item = &RankedConversation> {
    report
        .ranked
        .iter()
        .filter(move |r| !flagged_only || r.is_beacon())
}

/// Exports a report in the specified format
pub fn export_report(report: &AnalysisReport, format: OutputFormat, flagged_only: bool) -> String {
    match format {
        OutputFormat::Text => export_text(report, flagged_only),
        OutputFormat::Json => export_json(report, flagged_only),
        OutputFormat::JsonLines => export_jsonl(report, flagged_only),
    }
}

/// Exports report as pretty-printed JSON
pub fn export_json(report: &AnalysisReport, flagged_only: bool) -> String {
    let json_report = JsonReport::new(report, flagged_only);
    serde_json::to_string_pretty(&json_report)
        .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

/// Exports report as JSON Lines (one conversation per line)
pub fn export_jsonl(report: &AnalysisReport, flagged_only: bool) -> String {
    let mut lines = Vec::new();

    // First line is the summary
    let summary = serde_json::json!({
        "type": "summary",
        "timestamp": report.timestamp.to_rfc3339(),
        "beacon_threshold": report.beacon_threshold,
        "conversations_seen": report.aggregation.conversations_seen,
        "conversations_scored": report.ranked.len(),
        "flagged_count": report.flagged_count(),
        "warnings": report.warnings.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
    });
    lines.push(serde_json::to_string(&summary).unwrap_or_default());

    for ranked in selected(report, flagged_only) {
        if let Ok(line) = serde_json::to_string(&JsonConversation::from(ranked)) {
            lines.push(line);
        }
    }

    lines.join("\n")
}

/// Exports report as formatted text
pub fn export_text(report: &AnalysisReport, flagged_only: bool) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "--- Beacon Analysis Report ---\nTime: {}\nConversations Seen: {}\nConversations Scored: {}\nBeacon Threshold: {:.3}\n",
        report.timestamp.format("%Y-%m-%d %H:%M:%S"),
        report.aggregation.conversations_seen,
        report.ranked.len(),
        report.beacon_threshold,
    ));

    let rows: Vec<_> = selected(report, flagged_only).collect();
    if !rows.is_empty() {
        output.push_str(&format!(
            "\n{:>5} {:>7} {:>6}  {:<24} {:<32} {:>6} {:>6} {:>6} {:>6} {:>9} {:>6} {:>10}\n",
            "Rank", "Score", "Count", "Source", "Destination", "Skew", "MAD", "Rate", "Data", "Interval",
            "Hours", "Verdict"
        ));
        output.push_str(&"-".repeat(138));
        output.push('\n');

        for ranked in rows {
            output.push_str(&format_row(ranked));
            output.push('\n');
        }
    }

    let flagged: Vec<_> = report.flagged().collect();
    if flagged.is_empty() {
        output.push_str("\nPossible Beacons: None detected\n");
    } else {
        output.push_str(&format!("\nPossible Beacons ({}):\n", flagged.len()));
        for ranked in flagged {
            output.push_str(&format!(
                "  {:.3}  {} ({} connections over {:.1}h, every ~{})\n",
                ranked.conversation.scores.rounded(),
                ranked.conversation.key,
                ranked.conversation.count,
                ranked.conversation.duration_hours(),
                format_interval(ranked.conversation.features.mid),
            ));
        }
    }

    if !report.warnings.is_empty() {
        output.push_str(&format!("\nExcluded Conversations ({}):\n", report.warnings.len()));
        for warning in &report.warnings {
            output.push_str(&format!("  {}\n", warning));
        }
    }

    output
}

fn format_row(ranked: &RankedConversation) -> String {
    let conversation = &ranked.conversation;
    let scores = &conversation.scores;

    format!(
        "{:>5} {:>7.3} {:>6}  {:<24} {:<32} {:>6.3} {:>6.3} {:>6.3} {:>6} {:>9} {:>6.1} {:>10}",
        ranked.rank,
        scores.rounded(),
        conversation.count,
        truncate(&conversation.key.source, 24),
        truncate(&endpoint(&conversation.key), 32),
        scores.skew_score,
        scores.dispersion_score,
        scores.rate_score,
        format_data_score(scores.data.as_ref()),
        format_interval(conversation.features.mid),
        conversation.duration_hours(),
        ranked.verdict.label(),
    )
}

/// Destination with the port and method parts of the key, when present.
fn endpoint(key: &ConversationKey) -> String {
    let mut endpoint = key.destination.clone();
    if let Some(port) = key.port {
        endpoint.push_str(&format!(":{}", port));
    }
    if let Some(method) = &key.method {
        endpoint.push(' ');
        endpoint.push_str(method);
    }
    endpoint
}

fn format_data_score(data: Option<&DataScores>) -> String {
    match data {
        Some(data) => format!("{:.3}", data.score),
        None => "-".to_string(),
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        value.to_string()
    } else {
        let kept: String = value.chars().take(width.saturating_sub(1)).collect();
        format!("{}~", kept)
    }
}

/// Formats an interval in seconds in a human-readable way
fn format_interval(secs: f64) -> String {
    let magnitude = secs.abs();
    if magnitude >= 3600.0 {
        format!("{:.1}h", secs / 3600.0)
    } else if magnitude >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}s", secs)
    }
}
