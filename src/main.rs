//! Beacon-Finder: C2 beacon detection over proxy logs.
//!
//! Reads a closed batch of log rows, groups them into source/destination
//! conversations and ranks the conversations by how regular their
//! check-in intervals are.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Ingest    │────>│  Analyzer   │────>│   Export    │
//! │ (log file)  │     │ (workers)   │     │ text/json   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!     Sync           spawn_blocking           Sync
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use beacon_finder::analyzer::BeaconAnalyzer;
use beacon_finder::config::Config;
use beacon_finder::deltas::DeltaOrdering;
use beacon_finder::export::{export_report, OutputFormat};
use beacon_finder::ingest::{read_log_file, LogPreset};

/// Beacon-Finder: C2 beacon detection through log interval analysis.
#[derive(Parser, Debug)]
#[command(name = "beacon-finder")]
#[command(version = "0.1.0")]
#[command(about = "Detect C2 beaconing in proxy logs via statistical analysis of request intervals")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze a log file and rank conversations by beacon score.
    Analyze {
        /// Path to the log file.
        #[arg(short, long)]
        input: PathBuf,

        /// TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Column layout preset: default, proxy, dns.
        #[arg(long)]
        preset: Option<LogPreset>,

        /// Conversations need more than this many observations.
        #[arg(short = 'm', long)]
        min_count: Option<usize>,

        /// Scores strictly above this are flagged as possible beacons.
        #[arg(short = 't', long)]
        threshold: Option<f64>,

        /// Output format: text, json, jsonl.
        #[arg(short, long)]
        format: Option<OutputFormat>,

        /// Write the report to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only report flagged conversations.
        #[arg(long)]
        flagged_only: bool,

        /// Sort each conversation's timestamps before differencing.
        #[arg(long)]
        chronological: bool,

        /// Span unit (seconds) for the rate score.
        #[arg(long)]
        rate_window: Option<f64>,

        /// Weight of the transfer-size score (0 scores timing only).
        #[arg(long)]
        data_weight: Option<f64>,

        /// Skip rows that fail to parse instead of aborting.
        #[arg(long)]
        skip_malformed: bool,

        /// Number of scoring workers.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Enable verbose logging (writes to stderr).
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print a default configuration file.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            input,
            config,
            preset,
            min_count,
            threshold,
            format,
            output,
            flagged_only,
            chronological,
            rate_window,
            data_weight,
            skip_malformed,
            workers,
            verbose,
        } => {
            init_logging(verbose)?;
            let mut settings = Config::load_optional(config.as_deref())?;

            if let Some(preset) = preset {
                settings.ingest.apply_preset(preset);
            }
            if skip_malformed {
                settings.ingest.skip_malformed = true;
            }
            if let Some(min_count) = min_count {
                settings.aggregation.min_activity_threshold = min_count;
            }
            if let Some(threshold) = threshold {
                settings.analyzer.beacon_threshold = threshold;
            }
            if chronological {
                settings.analyzer.ordering = DeltaOrdering::Chronological;
            }
            if let Some(workers) = workers {
                settings.analyzer.workers = workers;
            }
            if let Some(window) = rate_window {
                settings.scoring.rate_window_secs = window;
            }
            if let Some(weight) = data_weight {
                settings.scoring.data_weight = weight;
            }
            if let Some(format) = format {
                settings.output.format = format;
            }
            if let Some(output) = output {
                settings.output.file = Some(output.display().to_string());
            }
            if flagged_only {
                settings.output.flagged_only = true;
            }

            settings.validate().context("Invalid configuration")?;

            run_analysis(&input, &settings).await
        }

        Commands::Config => {
            print!("{}", Config::generate_default());
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

async fn run_analysis(input: &Path, settings: &Config) -> Result<()> {
    if let Some(out) = &settings.output.file {
        if same_file(input, Path::new(out)) {
            anyhow::bail!("Output file must differ from the input file: {}", out);
        }
    }

    let (records, ingest_stats) = read_log_file(input, &settings.ingest)
        .with_context(|| format!("Failed to read log file: {}", input.display()))?;
    info!(
        "Read {} records ({} lines, {} filtered, {} malformed)",
        ingest_stats.records_accepted,
        ingest_stats.lines_read,
        ingest_stats.sentinel_filtered,
        ingest_stats.malformed_skipped
    );

    let analyzer = BeaconAnalyzer::new(
        settings.aggregation.clone(),
        settings.analyzer.clone(),
        settings.scoring.clone(),
    );
    let mut report = analyzer.run_parallel(&records).await?;
    report.ingest = Some(ingest_stats);

    let rendered = export_report(&report, settings.output.format, settings.output.flagged_only);

    match &settings.output.file {
        Some(path) => {
            std::fs::write(path, rendered + "\n")
                .with_context(|| format!("Failed to write report: {}", path))?;
            info!("Report written to {}", path);
        }
        None => println!("{}", rendered),
    }

    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
