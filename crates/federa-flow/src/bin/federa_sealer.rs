//! # federa-sealer
//!
//! Operator tool for the staleness sealer.
//!
//! Both modes load a JSON snapshot (an array of query contexts) into an
//! in-memory store and record dispatcher signals instead of sending them.
//!
//! ## Usage
//!
//! ```bash
//! # Run three passes at a fixed instant, one minute apart
//! federa-sealer replay --snapshot queries.json --now 2024-05-01T12:00:00Z --passes 3 --advance-secs 60
//!
//! # Run the periodic service until Ctrl-C
//! federa-sealer --config federa.json watch --snapshot queries.json --interval-secs 10
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use federa_core::observability::{LogFormat, init_logging};
use federa_flow::aggregate::FederatedResult;
use federa_flow::config::EngineConfig;
use federa_flow::dispatch::memory::RecordingDispatcher;
use federa_flow::metrics::register_metrics;
use federa_flow::query::QueryContext;
use federa_flow::sealer::{SealReport, StalenessSealer};
use federa_flow::service::SealerService;
use federa_flow::store::memory::InMemoryQueryStore;

// ============================================================================
// CLI Arguments
// ============================================================================

/// Federated query staleness sealer.
#[derive(Debug, Parser)]
#[command(name = "federa-sealer")]
#[command(about = "Seals stale and fully-reported federated queries")]
#[command(version)]
struct Args {
    /// Engine configuration file (JSON). Defaults apply when omitted.
    #[arg(long, env = "FEDERA_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log output format (`json` or `pretty`).
    #[arg(long, env = "FEDERA_LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run sealer passes over a snapshot and print the results as JSON.
    Replay {
        /// Snapshot file: a JSON array of query contexts.
        #[arg(long)]
        snapshot: PathBuf,

        /// Instant of the first pass (RFC 3339). Defaults to the current time.
        #[arg(long)]
        now: Option<DateTime<Utc>>,

        /// Number of passes to run.
        #[arg(long, default_value = "1")]
        passes: u32,

        /// Seconds added to the clock between passes.
        #[arg(long, default_value = "0")]
        advance_secs: u64,
    },

    /// Run the periodic sealer service over a snapshot until Ctrl-C.
    Watch {
        /// Snapshot file: a JSON array of query contexts.
        #[arg(long)]
        snapshot: PathBuf,

        /// Pass interval in seconds. Overrides the configuration file.
        #[arg(long, env = "FEDERA_SEALER_INTERVAL_SECS")]
        interval_secs: Option<u64>,
    },
}

/// Everything `replay` prints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplayOutput {
    reports: Vec<SealReport>,
    publications: Vec<FederatedResult>,
    queries: Vec<QueryContext>,
}

// ============================================================================
// Commands
// ============================================================================

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn load_store(path: &Path) -> Result<Arc<InMemoryQueryStore>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    let queries: Vec<QueryContext> = serde_json::from_str(&json)
        .with_context(|| format!("parsing snapshot {}", path.display()))?;
    let count = queries.len();
    let store = InMemoryQueryStore::from_snapshot(queries)?;
    tracing::info!(queries = count, snapshot = %path.display(), "snapshot loaded");
    Ok(Arc::new(store))
}

async fn replay(
    config: &EngineConfig,
    snapshot: &Path,
    now: Option<DateTime<Utc>>,
    passes: u32,
    advance_secs: u64,
) -> Result<ReplayOutput> {
    let store = load_store(snapshot)?;
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let sealer = StalenessSealer::from_config(store.clone(), dispatcher.clone(), config)?;

    let step = chrono::Duration::seconds(i64::try_from(advance_secs).context("advance too large")?);
    let mut at = now.unwrap_or_else(Utc::now);
    let mut reports = Vec::new();
    for _ in 0..passes {
        reports.push(sealer.run_once(at).await);
        at += step;
    }

    Ok(ReplayOutput {
        reports,
        publications: dispatcher.publications()?,
        queries: store.snapshot()?,
    })
}

async fn watch(config: &EngineConfig, snapshot: &Path, interval_secs: Option<u64>) -> Result<()> {
    let store = load_store(snapshot)?;
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let interval = interval_secs.map_or(config.sealer.interval, Duration::from_secs);
    anyhow::ensure!(!interval.is_zero(), "interval must be positive");

    let sealer = StalenessSealer::from_config(store.clone(), dispatcher.clone(), config)?;
    let service = SealerService::new(sealer, interval);

    let passes = service
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
            }
        })
        .await;

    tracing::info!(
        passes,
        publications = dispatcher.publications()?.len(),
        queries = store.len()?,
        "watch finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_format: LogFormat = args.log_format.parse()?;
    init_logging(log_format);
    register_metrics();

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::Replay {
            snapshot,
            now,
            passes,
            advance_secs,
        } => {
            let output = replay(&config, &snapshot, now, passes, advance_secs).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Watch {
            snapshot,
            interval_secs,
        } => watch(&config, &snapshot, interval_secs).await?,
    }
    Ok(())
}
