//! Log Ingestion Module
//!
//! Reads delimited proxy / DNS logs and turns each row into a [`LogRecord`].
//! Column positions, delimiter and timestamp layout are configurable, with
//! presets matching the common proxy and DNS log exports.

use std::io::BufRead;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::IngestError;

/// Placeholder written by proxies when a field is unknown.
pub const UNKNOWN_SENTINEL: &str = "-";

/// Special `time_format` value selecting fractional Unix epoch seconds.
pub const EPOCH_FORMAT: &str = "epoch";

/// A single parsed log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub destination: String,
    /// Destination port, when a port column is configured
    pub port: Option<u16>,
    /// HTTP method, when a method column is configured
    pub method: Option<String>,
    pub bytes_sent: Option<u64>,
    pub bytes_received: Option<u64>,
}

impl LogRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            source: source.into(),
            destination: destination.into(),
            port: None,
            method: None,
            bytes_sent: None,
            bytes_received: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_bytes(mut self, sent: u64, received: u64) -> Self {
        self.bytes_sent = Some(sent);
        self.bytes_received = Some(received);
        self
    }
}

/// Column layout presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogPreset {
    /// Comma separated proxy export
    #[default]
    Default,
    /// Space separated proxy log with method, port and byte counts
    Proxy,
    /// DNS query log (source client, queried name)
    Dns,
}

impl std::str::FromStr for LogPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "proxy" => Ok(Self::Proxy),
            "dns" => Ok(Self::Dns),
            _ => Err(format!("Unknown log preset: {}", s)),
        }
    }
}

impl std::fmt::Display for LogPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Proxy => write!(f, "proxy"),
            Self::Dns => write!(f, "dns"),
        }
    }
}

/// Configuration for reading a log file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// Field separator (a single character)
    pub delimiter: char,
    /// Zero-based column holding the timestamp
    pub time_column: usize,
    /// Zero-based column holding the source identity
    pub source_column: usize,
    /// Zero-based column holding the destination identity
    pub destination_column: usize,
    /// Zero-based column holding the destination port; adds the port to
    /// the conversation key
    pub port_column: Option<usize>,
    /// Zero-based column holding the HTTP method; adds the method to the
    /// conversation key
    pub method_column: Option<usize>,
    /// Zero-based column holding bytes sent by the source
    pub bytes_sent_column: Option<usize>,
    /// Zero-based column holding bytes received by the source
    pub bytes_received_column: Option<usize>,
    /// chrono strftime layout, or "epoch"
    pub time_format: String,
    /// Rows where source or destination equal this value are dropped
    pub sentinel: String,
    /// Skip rows that fail to parse instead of aborting
    pub skip_malformed: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::from_preset(LogPreset::Default)
    }
}

impl IngestConfig {
    pub fn from_preset(preset: LogPreset) -> Self {
        let mut config = Self {
            delimiter: ',',
            time_column: 0,
            source_column: 0,
            destination_column: 0,
            port_column: None,
            method_column: None,
            bytes_sent_column: None,
            bytes_received_column: None,
            time_format: String::new(),
            sentinel: UNKNOWN_SENTINEL.to_string(),
            skip_malformed: false,
        };
        config.apply_preset(preset);
        config
    }

    /// Replaces the column layout, delimiter and time format with the
    /// preset's, leaving the remaining settings untouched.
    pub fn apply_preset(&mut self, preset: LogPreset) {
        let (delimiter, source_column, destination_column, time_format) = match preset {
            LogPreset::Default => (',', 2, 7, "%Y-%m-%d-%H:%M:%S"),
            LogPreset::Proxy => (' ', 2, 7, "%Y-%m-%d-%H:%M:%S"),
            LogPreset::Dns => (',', 1, 2, "%d-%b-%Y-%H:%M:%S"),
        };

        self.delimiter = delimiter;
        self.time_column = 0;
        self.source_column = source_column;
        self.destination_column = destination_column;
        self.time_format = time_format.to_string();

        if preset == LogPreset::Proxy {
            self.method_column = Some(5);
            self.port_column = Some(6);
            self.bytes_received_column = Some(11);
            self.bytes_sent_column = Some(12);
        } else {
            self.method_column = None;
            self.port_column = None;
            self.bytes_received_column = None;
            self.bytes_sent_column = None;
        }
    }

    fn required_columns(&self) -> usize {
        let highest = [
            Some(self.time_column),
            Some(self.source_column),
            Some(self.destination_column),
            self.port_column,
            self.method_column,
            self.bytes_sent_column,
            self.bytes_received_column,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0);
        highest + 1
    }
}

/// Counters collected while reading a log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub lines_read: usize,
    pub records_accepted: usize,
    pub sentinel_filtered: usize,
    pub malformed_skipped: usize,
}

/// Reads and parses a log file.
pub fn read_log_file(
    path: &Path,
    config: &IngestConfig,
) -> Result<(Vec<LogRecord>, IngestStats), IngestError> {
    let io_err = |source: std::io::Error| IngestError::Io {
        path: path.display().to_string(),
        source,
    };

    info!("Opening log file: {}", path.display());
    let file = std::fs::File::open(path).map_err(io_err)?;
    let reader = std::io::BufReader::new(file);

    let mut lines = Vec::new();
    for line in reader.lines() {
        lines.push(line.map_err(io_err)?);
    }

    parse_lines(lines.iter().map(String::as_str), config)
}

/// Parses log lines, applying the sentinel filter.
pub fn parse_lines<'a, I>(
    lines: I,
    config: &IngestConfig,
) -> Result<(Vec<LogRecord>, IngestStats), IngestError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut records = Vec::new();
    let mut stats = IngestStats::default();

    for (index, line) in lines.into_iter().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        stats.lines_read += 1;

        match parse_line(line, line_no, config) {
            Ok(Some(record)) => {
                trace!(
                    "Line {}: {} -> {} at {}",
                    line_no,
                    record.source,
                    record.destination,
                    record.timestamp
                );
                records.push(record);
                stats.records_accepted += 1;
            }
            Ok(None) => stats.sentinel_filtered += 1,
            Err(e) if config.skip_malformed => {
                warn!("Skipping malformed row: {}", e);
                stats.malformed_skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    debug!(
        "Ingestion: {} lines, {} accepted, {} sentinel rows, {} malformed",
        stats.lines_read, stats.records_accepted, stats.sentinel_filtered, stats.malformed_skipped
    );

    Ok((records, stats))
}

/// Parses a single row. Returns `Ok(None)` for sentinel rows.
fn parse_line(
    line: &str,
    line_no: usize,
    config: &IngestConfig,
) -> Result<Option<LogRecord>, IngestError> {
    let fields = split_fields(line, config.delimiter);
    let required = config.required_columns();
    if fields.len() < required {
        return Err(IngestError::MissingColumn {
            line: line_no,
            required,
            actual: fields.len(),
        });
    }

    let source = fields[config.source_column].as_str();
    let destination = fields[config.destination_column].as_str();
    if source == config.sentinel || destination == config.sentinel {
        return Ok(None);
    }

    let raw_time = fields[config.time_column].as_str();
    let timestamp = parse_timestamp(raw_time, &config.time_format).ok_or_else(|| {
        IngestError::MalformedTimestamp {
            line: line_no,
            value: raw_time.to_string(),
            format: config.time_format.clone(),
        }
    })?;

    let mut record = LogRecord::new(timestamp, source, destination);
    if let Some(column) = config.port_column {
        record.port = Some(parse_field(&fields[column], "port", line_no)?);
    }
    if let Some(column) = config.method_column {
        record.method = Some(fields[column].clone());
    }
    if let Some(column) = config.bytes_sent_column {
        record.bytes_sent = Some(parse_field(&fields[column], "bytes sent", line_no)?);
    }
    if let Some(column) = config.bytes_received_column {
        record.bytes_received = Some(parse_field(&fields[column], "bytes received", line_no)?);
    }

    Ok(Some(record))
}

fn parse_field<T: std::str::FromStr>(
    value: &str,
    field: &'static str,
    line_no: usize,
) -> Result<T, IngestError> {
    value.trim().parse().map_err(|_| IngestError::MalformedField {
        line: line_no,
        field,
        value: value.to_string(),
    })
}

/// Parses a timestamp as UTC using a strftime layout or `"epoch"`.
pub fn parse_timestamp(value: &str, format: &str) -> Option<DateTime<Utc>> {
    if format == EPOCH_FORMAT {
        let secs: f64 = value.parse().ok()?;
        if !secs.is_finite() {
            return None;
        }
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
        return DateTime::from_timestamp(whole as i64, nanos);
    }

    NaiveDateTime::parse_from_str(value, format)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Splits a row on `delimiter`, honoring double-quoted fields.
fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in line.trim_end_matches(&['\r', '\n'][..]).chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    fields.push(current);

    fields
}
