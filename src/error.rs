//! Domain-specific error types for beacon-finder.
//!
//! Uses `thiserror` for ergonomic error definitions that integrate
//! with the broader `anyhow` error handling strategy.

use thiserror::Error;

/// Errors that can occur while reading log records.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to read log file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: expected at least {required} columns, found {actual}")]
    MissingColumn {
        line: usize,
        required: usize,
        actual: usize,
    },

    #[error("Line {line}: cannot parse timestamp '{value}' with format '{format}'")]
    MalformedTimestamp {
        line: usize,
        value: String,
        format: String,
    },

    #[error("Line {line}: invalid {field} value '{value}'")]
    MalformedField {
        line: usize,
        field: &'static str,
        value: String,
    },
}

/// Per-conversation failures raised by the scoring pipeline.
///
/// These never abort a run; the offending conversation is excluded from the
/// ranking and the error is surfaced in the report's warning list.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyzerError {
    #[error("Conversation {src} -> {dst} spans zero seconds across {count} observations")]
    ZeroSpan {
        src: String,
        dst: String,
        count: usize,
    },

    #[error("Insufficient data points for analysis (need at least {required}, got {actual})")]
    InsufficientData { required: usize, actual: usize },
}

/// Result type alias using anyhow for application-level error handling.
pub type Result<T> = anyhow::Result<T>;
