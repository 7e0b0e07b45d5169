//! tsdb-backfill binary
//!
//! Walks an input directory for Parquet snapshot files and backfills them
//! into TSDB blocks under the output directory.

use tsdb_backfill::config::{BackfillConfig, ComponentFactory};
use tsdb_backfill::ingester::Backfill;
use tsdb_backfill::schema::RecordSchema;
use tsdb_backfill::source::{discover_files, ParquetSource};

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Backfill historical snapshot records into TSDB blocks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory scanned recursively for `.parquet` input files
    #[arg(long, env = "BACKFILL_INPUT")]
    input: PathBuf,

    /// Directory blocks are written under
    #[arg(long, env = "BACKFILL_OUTPUT", default_value = "data")]
    output: PathBuf,

    /// JSON record schema; the built-in container usage schema when omitted
    #[arg(long, env = "BACKFILL_SCHEMA")]
    schema: Option<PathBuf>,

    /// Maximum time span of one block, in seconds (default: 8 days)
    #[arg(long, env = "BLOCK_DURATION_SECS", default_value = "691200")]
    block_duration_secs: u64,

    /// Samples per block before it is rolled over
    #[arg(long, env = "MAX_SAMPLES_PER_BLOCK", default_value = "100000000")]
    max_samples_per_block: u64,

    /// Buffered rows that trigger a drain into the block writer
    #[arg(long, env = "DRAIN_THRESHOLD", default_value = "1000")]
    drain_threshold: usize,

    /// Batches in flight between readers and mapping workers
    #[arg(long, env = "CHANNEL_CAPACITY", default_value = "64")]
    channel_capacity: usize,

    /// Files read concurrently
    #[arg(long, env = "READER_CONCURRENCY", default_value = "40")]
    reader_concurrency: usize,

    /// Batches mapped concurrently
    #[arg(long, env = "MARSHAL_CONCURRENCY", default_value = "32")]
    marshal_concurrency: usize,

    /// Seconds added to every record timestamp
    #[arg(long, env = "TIMESTAMP_OFFSET_SECS", default_value = "1583020800")]
    timestamp_offset_secs: i64,

    /// Progress report period in seconds
    #[arg(long, env = "STATUS_INTERVAL_SECS", default_value = "10")]
    status_interval_secs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,
}

impl Args {
    fn backfill_config(&self) -> BackfillConfig {
        BackfillConfig {
            block_duration: Duration::from_secs(self.block_duration_secs),
            max_samples_per_block: self.max_samples_per_block,
            drain_threshold: self.drain_threshold,
            channel_capacity: self.channel_capacity,
            reader_concurrency: self.reader_concurrency,
            marshal_concurrency: self.marshal_concurrency,
            timestamp_offset_secs: self.timestamp_offset_secs,
            status_interval: Duration::from_secs(self.status_interval_secs),
            input_path: self.input.clone(),
            output_path: self.output.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(true);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = args.backfill_config();
    config.validate()?;

    let schema = match &args.schema {
        Some(path) => RecordSchema::from_json_file(path)
            .with_context(|| format!("loading schema {}", path.display()))?,
        None => RecordSchema::container_usage(),
    };
    let schema = Arc::new(schema);

    let files = discover_files(&config.input_path)
        .with_context(|| format!("scanning {}", config.input_path.display()))?;
    if files.is_empty() {
        warn!(input = %config.input_path.display(), "No input files found");
    }
    info!(
        input = %config.input_path.display(),
        output = %config.output_path.display(),
        files = files.len(),
        "Starting tsdb-backfill"
    );

    let store = ComponentFactory::create_block_store(&config)?;
    let source = Arc::new(ParquetSource::new(Arc::clone(&schema)));
    let job = Backfill::new(config, &schema, source, store)?;

    let shutdown = job.shutdown_token();
    tokio::spawn(cancel_on_signal(shutdown));

    let state = job.state();
    let result = job.run(&files).await;

    println!("{}", state.snapshot());
    match result {
        Ok(summary) => {
            info!(
                blocks = summary.blocks.len(),
                samples = summary.samples_appended,
                "Backfill finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Backfill failed");
            Err(e.into())
        }
    }
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to install Ctrl+C handler");
                return;
            }
            warn!("Interrupted, cancelling backfill");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}
