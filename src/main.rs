//! CLI entry point for the delay meter.
//!
//! Provides subcommands for a one-shot backfill over recent reading
//! batches, a continuous polling loop, and a trailing-window delay
//! report over already-persisted records.

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use gtfs_delay_meter::engine::CorrelationEngine;
use gtfs_delay_meter::readings::FsReadingsSource;
use gtfs_delay_meter::report::{build_report, log_report, print_json};
use gtfs_delay_meter::schedule::ScheduleIndex;
use gtfs_delay_meter::schedule::tables::load_tables;
use gtfs_delay_meter::store::DelayStore;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_delay_meter")]
#[command(about = "Correlates real-time bus positions against the static timetable", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process the most recent reading batches once and exit
    Backfill {
        /// Directory with the extracted GTFS tables
        #[arg(short, long, default_value = "gtfs_cache/extracted")]
        gtfs_dir: String,

        /// Directory the collector writes reading batches into
        #[arg(short, long, default_value = "data/readings")]
        readings_dir: String,

        /// CSV file delay records are appended to
        #[arg(short, long, default_value = "data/delays.csv")]
        delays: String,

        /// Number of most recent batches to process
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
    /// Poll for new reading batches until interrupted
    Watch {
        /// Directory with the extracted GTFS tables
        #[arg(short, long, default_value = "gtfs_cache/extracted")]
        gtfs_dir: String,

        /// Directory the collector writes reading batches into
        #[arg(short, long, default_value = "data/readings")]
        readings_dir: String,

        /// CSV file delay records are appended to
        #[arg(short, long, default_value = "data/delays.csv")]
        delays: String,

        /// Poll interval in seconds
        #[arg(short, long, default_value_t = 300)]
        interval: u64,
    },
    /// Summarize persisted delays over a trailing day window
    Report {
        /// CSV file delay records were appended to
        #[arg(short, long, default_value = "data/delays.csv")]
        delays: String,

        /// Window size in days
        #[arg(long, default_value_t = 7)]
        days: i64,

        /// Emit the report as pretty-printed JSON instead of log lines
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_delay_meter.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_delay_meter.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Backfill {
            gtfs_dir,
            readings_dir,
            delays,
            limit,
        } => {
            let engine = open_engine(&gtfs_dir, &readings_dir, &delays)?;
            engine.backfill(limit).await?;
        }
        Commands::Watch {
            gtfs_dir,
            readings_dir,
            delays,
            interval,
        } => {
            let engine = open_engine(&gtfs_dir, &readings_dir, &delays)?;

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested, finishing current cycle");
                    let _ = shutdown_tx.send(true);
                }
            });

            engine
                .run_continuous(Duration::from_secs(interval), shutdown_rx)
                .await?;
        }
        Commands::Report { delays, days, json } => {
            let store = DelayStore::open(&delays)?;
            let now = Local::now().naive_local();
            let records = store.load_since(now - chrono::Duration::days(days))?;
            let report = build_report(&records, days, now);

            if json {
                print_json(&report)?;
            } else {
                log_report(&report);
            }
        }
    }

    Ok(())
}

/// Loads the timetable, opens the delay store, and wires the engine.
/// Any failure here is fatal: the run starts with no partial state.
fn open_engine(
    gtfs_dir: &str,
    readings_dir: &str,
    delays: &str,
) -> Result<CorrelationEngine<FsReadingsSource>> {
    let tables = load_tables(Path::new(gtfs_dir))?;
    let schedule = Arc::new(ScheduleIndex::from_tables(tables)?);
    info!(
        stops = schedule.stop_count(),
        trips = schedule.trip_count(),
        "Schedule loaded"
    );

    let store = DelayStore::open(delays)?;
    let source = FsReadingsSource::new(readings_dir);

    Ok(CorrelationEngine::new(source, store, schedule))
}
