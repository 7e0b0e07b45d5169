//! Job progress counters and the periodic status reporter

use crate::storage::BlockStats;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Row counters shared by readers, mapping workers and the reporter.
///
/// `done` only ever grows; `total` shrinks when a reader abandons a file,
/// by the number of rows it will never deliver.
#[derive(Debug)]
pub struct PipelineState {
    total: AtomicU64,
    done: AtomicU64,
    rows_dropped: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
    block_stats: Arc<BlockStats>,
}

impl PipelineState {
    pub fn new(block_stats: Arc<BlockStats>) -> Self {
        Self {
            total: AtomicU64::new(0),
            done: AtomicU64::new(0),
            rows_dropped: AtomicU64::new(0),
            started_at: Utc::now(),
            started: Instant::now(),
            block_stats,
        }
    }

    pub fn set_total(&self, rows: u64) {
        self.total.store(rows, Ordering::SeqCst);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::SeqCst)
    }

    pub fn rows_dropped(&self) -> u64 {
        self.rows_dropped.load(Ordering::SeqCst)
    }

    /// Count rows whose samples are in the ordering buffer
    pub fn add_done(&self, rows: u64) {
        self.done.fetch_add(rows, Ordering::SeqCst);
    }

    /// Remove rows that will never be delivered from the expected total
    pub fn abandon_rows(&self, rows: u64) {
        let _ = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.saturating_sub(rows))
            });
        self.rows_dropped.fetch_add(rows, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.done() >= self.total()
    }

    pub fn block_stats(&self) -> &BlockStats {
        &self.block_stats
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let memory = sample_process_memory();
        ProgressSnapshot {
            done: self.done(),
            total: self.total(),
            elapsed: self.started.elapsed(),
            started_at: self.started_at,
            now: Utc::now(),
            rss_bytes: memory.rss_bytes,
            virtual_bytes: memory.virtual_bytes,
            rows_dropped: self.rows_dropped(),
            samples_appended: self.block_stats.samples_appended(),
            samples_dropped: self.block_stats.samples_dropped(),
            blocks_flushed: self.block_stats.blocks_flushed(),
        }
    }
}

/// Point-in-time view of job progress
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub done: u64,
    pub total: u64,
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub rss_bytes: Option<u64>,
    pub virtual_bytes: Option<u64>,
    pub rows_dropped: u64,
    pub samples_appended: u64,
    pub samples_dropped: u64,
    pub blocks_flushed: u64,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.done as f64 * 100.0 / self.total as f64
    }

    /// Rows per second since the job started
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.done as f64 / secs
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = format!("{}/{}", self.done, self.total);
        let percent = format!("{:.2}%", self.percent());
        let rate = format!("{:.2} rows/s", self.rate());
        let started = self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let now = self.now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let elapsed = format_elapsed(self.elapsed);

        writeln!(
            f,
            "{:<24}{:<14}{:<20}{:<24}{:<24}{}",
            "Progress", "Progress (%)", "Rapidity", "Start time", "Current time", "Duration"
        )?;
        writeln!(
            f,
            "{:<24}{:<14}{:<20}{:<24}{:<24}{}",
            progress, percent, rate, started, now, elapsed
        )?;
        writeln!(f, "{:<24}{}", "Resident memory:", format_bytes(self.rss_bytes))?;
        writeln!(f, "{:<24}{}", "Virtual memory:", format_bytes(self.virtual_bytes))?;
        writeln!(f, "{:<24}{}", "Rows dropped:", self.rows_dropped)?;
        writeln!(f, "{:<24}{}", "Samples appended:", self.samples_appended)?;
        writeln!(f, "{:<24}{}", "Samples dropped:", self.samples_dropped)?;
        write!(f, "{:<24}{}", "Blocks flushed:", self.blocks_flushed)
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn format_bytes(bytes: Option<u64>) -> String {
    match bytes {
        Some(b) => format!("{:.1} MiB", b as f64 / (1024.0 * 1024.0)),
        None => "n/a".to_string(),
    }
}

/// Log a progress row every `interval` until the job completes or is cancelled
pub async fn run_status_loop(
    state: Arc<PipelineState>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = state.snapshot();
                info!(
                    done = snapshot.done,
                    total = snapshot.total,
                    percent = %format!("{:.2}", snapshot.percent()),
                    rows_per_sec = %format!("{:.2}", snapshot.rate()),
                    elapsed = %format_elapsed(snapshot.elapsed),
                    rss = %format_bytes(snapshot.rss_bytes),
                    vm = %format_bytes(snapshot.virtual_bytes),
                    rows_dropped = snapshot.rows_dropped,
                    samples_dropped = snapshot.samples_dropped,
                    "Backfill progress"
                );
                if state.is_complete() {
                    debug!("Status reporter finished");
                    return;
                }
            }
            _ = shutdown.cancelled() => {
                debug!("Status reporter cancelled");
                return;
            }
        }
    }
}

/// Process-level memory usage sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessMemorySample {
    pub rss_bytes: Option<u64>,
    pub virtual_bytes: Option<u64>,
}

/// Reads `/proc/self/status` on Linux; empty elsewhere.
pub fn sample_process_memory() -> ProcessMemorySample {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/proc/self/status") {
            Ok(contents) => ProcessMemorySample {
                rss_bytes: parse_kib_field(&contents, "VmRSS:"),
                virtual_bytes: parse_kib_field(&contents, "VmSize:"),
            },
            Err(_) => ProcessMemorySample::default(),
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        ProcessMemorySample::default()
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_kib_field(status: &str, field: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with(field))?;
    line.split_whitespace()
        .nth(1)
        .and_then(|value| value.parse::<u64>().ok())?
        .checked_mul(1024)
}
