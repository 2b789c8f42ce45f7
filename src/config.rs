//! Configuration Module
//!
//! Provides TOML-based configuration for beacon-finder.
//! Configuration is optional - CLI arguments can override file settings.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregatorConfig;
use crate::analyzer::AnalyzerConfig;
use crate::export::OutputFormat;
use crate::ingest::IngestConfig;
use crate::scoring::ScoringParams;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub ingest: IngestConfig,
    pub aggregation: AggregatorConfig,
    pub analyzer: AnalyzerConfig,
    pub scoring: ScoringParams,
    pub output: OutputConfig,
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Loads the given configuration file, or returns defaults when no path
    /// is supplied. A supplied file that cannot be read or parsed is an error.
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Generates a default configuration file content
    pub fn generate_default() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config)
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.ingest.delimiter == '"' {
            anyhow::bail!("delimiter cannot be the quote character");
        }
        if self.ingest.time_format.is_empty() {
            anyhow::bail!("time_format must not be empty");
        }
        if !(0.0..=1.0).contains(&self.analyzer.beacon_threshold) {
            anyhow::bail!("beacon_threshold must be between 0.0 and 1.0");
        }
        if self.analyzer.workers == 0 {
            anyhow::bail!("workers must be greater than 0");
        }
        if let Some(hours) = self.aggregation.min_duration_hours {
            if hours < 0.0 {
                anyhow::bail!("min_duration_hours must not be negative");
            }
        }
        if self.aggregation.max_sources_per_destination == Some(0) {
            anyhow::bail!("max_sources_per_destination must be greater than 0");
        }

        let scoring = &self.scoring;
        if scoring.dispersion_normalizer <= 0.0 {
            anyhow::bail!("dispersion_normalizer must be greater than 0");
        }
        if scoring.rate_numerator <= 0.0 {
            anyhow::bail!("rate_numerator must be greater than 0");
        }
        if scoring.rate_window_secs <= 0.0 {
            anyhow::bail!("rate_window_secs must be greater than 0");
        }
        if scoring.size_dispersion_normalizer <= 0.0 || scoring.smallness_normalizer <= 0.0 {
            anyhow::bail!("size normalizers must be greater than 0");
        }
        if scoring.time_weight < 0.0 || scoring.data_weight < 0.0 {
            anyhow::bail!("time_weight and data_weight must not be negative");
        }
        if scoring.time_weight + scoring.data_weight <= 0.0 {
            anyhow::bail!("time_weight and data_weight cannot both be 0");
        }
        if !scoring.percentiles.is_valid() {
            anyhow::bail!("percentiles must satisfy 0 <= low < mid < high <= 100");
        }
        if let Some(w) = scoring.weights {
            if w.skew < 0.0 || w.dispersion < 0.0 || w.rate < 0.0 {
                anyhow::bail!("score weights must not be negative");
            }
            if w.skew + w.dispersion + w.rate <= 0.0 {
                anyhow::bail!("at least one score weight must be positive");
            }
        }
        Ok(())
    }
}

/// Output-related configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Output format (text, json, jsonl)
    pub format: OutputFormat,
    /// Output file path (None = stdout)
    pub file: Option<String>,
    /// Only report conversations above the beacon threshold
    pub flagged_only: bool,
}
