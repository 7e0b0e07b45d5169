//! Block writer manager
//!
//! Owns the one open block session and its time window. A block accepts
//! timestamps in `[min_time, min_time + block_duration)`, where `min_time` is
//! set by the first sample appended to it. A sample outside the window, or a
//! block that already holds `max_samples_per_block` samples, rolls the block
//! over: commit, flush, close, and the sample starts a fresh block.
//!
//! Storage failures are logged and counted, never propagated: a failed
//! append drops that sample, a failed commit or flush drops every sample of
//! that block. A failed close is only logged, the block is already durable.

use super::{BlockMeta, BlockStats, BlockStore, BlockWriter};
use crate::mapper::Labels;
use crate::ingester::telemetry;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why a block was rolled over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloverReason {
    /// Sample timestamp outside the block's window
    TimeWindow,
    /// Block reached the per-block sample limit
    SampleCount,
    /// End of the job
    Finish,
}

impl RolloverReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloverReason::TimeWindow => "time_window",
            RolloverReason::SampleCount => "sample_count",
            RolloverReason::Finish => "finish",
        }
    }
}

/// The open session with its window watermark and sample count
struct ActiveBlock {
    writer: Box<dyn BlockWriter>,
    min_time: Option<i64>,
    samples: u64,
}

impl ActiveBlock {
    fn accepts(&self, timestamp_ms: i64, block_duration_ms: i64) -> bool {
        match self.min_time {
            Some(min) => timestamp_ms >= min && timestamp_ms - min < block_duration_ms,
            None => true,
        }
    }
}

/// Serializes all writes into the storage engine.
///
/// Every method takes `&mut self`; share it behind a single lock.
pub struct BlockWriterManager {
    store: Arc<dyn BlockStore>,
    block_duration_ms: i64,
    max_samples_per_block: u64,
    active: Option<ActiveBlock>,
    flushed: Vec<BlockMeta>,
    stats: Arc<BlockStats>,
}

impl BlockWriterManager {
    pub fn new(store: Arc<dyn BlockStore>, block_duration_ms: i64, max_samples_per_block: u64) -> Self {
        Self {
            store,
            block_duration_ms,
            max_samples_per_block,
            active: None,
            flushed: Vec::new(),
            stats: Arc::new(BlockStats::default()),
        }
    }

    /// Shared counters, readable without the manager's lock
    pub fn stats(&self) -> Arc<BlockStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// Lower bound of the open block's window, once its first sample is in
    pub fn window_start(&self) -> Option<i64> {
        self.active.as_ref().and_then(|a| a.min_time)
    }

    /// Samples appended to the open block
    pub fn active_samples(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.samples)
    }

    /// Metadata of every block flushed so far
    pub fn flushed_blocks(&self) -> &[BlockMeta] {
        &self.flushed
    }

    /// Open a block session if none is open
    pub async fn open(&mut self) -> bool {
        if self.active.is_some() {
            return true;
        }
        match self.store.open(self.block_duration_ms).await {
            Ok(writer) => {
                debug!(block_duration_ms = self.block_duration_ms, "Opened block writer");
                self.active = Some(ActiveBlock {
                    writer,
                    min_time: None,
                    samples: 0,
                });
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to open block writer");
                false
            }
        }
    }

    /// Append one sample, rolling the block over first when needed.
    ///
    /// Returns whether the sample was accepted.
    pub async fn append(&mut self, labels: &Labels, timestamp_ms: i64, value: f64) -> bool {
        let reason = self.active.as_ref().and_then(|active| {
            if active.samples >= self.max_samples_per_block {
                Some(RolloverReason::SampleCount)
            } else if !active.accepts(timestamp_ms, self.block_duration_ms) {
                Some(RolloverReason::TimeWindow)
            } else {
                None
            }
        });
        if let Some(reason) = reason {
            if reason == RolloverReason::TimeWindow {
                debug!(
                    timestamp_ms,
                    window_start = self.window_start(),
                    block_duration_ms = self.block_duration_ms,
                    "Sample outside the block window"
                );
            }
            self.rollover(reason).await;
        }

        if !self.open().await {
            self.drop_sample();
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            self.drop_sample();
            return false;
        };

        match active.writer.append(labels, timestamp_ms, value) {
            Ok(()) => {
                active.min_time.get_or_insert(timestamp_ms);
                active.samples += 1;
                self.stats.record_append();
                telemetry::record_sample_appended();
                true
            }
            Err(e) => {
                error!(error = %e, series = %labels, timestamp_ms, "Error appending sample");
                self.drop_sample();
                false
            }
        }
    }

    /// Commit, flush and close the open block. No-op when none is open.
    pub async fn rollover(&mut self, reason: RolloverReason) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        self.stats.record_rollover();
        telemetry::record_rollover(reason.as_str());

        if let Err(e) = active.writer.commit() {
            error!(error = %e, samples = active.samples, "Error on appender commit");
            self.drop_samples(active.samples);
            if let Err(e) = active.writer.close() {
                error!(error = %e, "Error closing block writer");
            }
            return;
        }
        match active.writer.flush().await {
            Ok(Some(meta)) => {
                info!(
                    block_id = %meta.block_id,
                    min_time = meta.min_time,
                    max_time = meta.max_time,
                    samples = meta.num_samples,
                    series = meta.num_series,
                    reason = reason.as_str(),
                    "Block written"
                );
                self.stats.record_flush();
                telemetry::record_block_flushed(meta.num_samples);
                self.flushed.push(meta);
            }
            Ok(None) => debug!(reason = reason.as_str(), "Rolled over an empty block"),
            Err(e) => {
                error!(error = %e, samples = active.samples, "Error flushing block");
                self.drop_samples(active.samples);
            }
        }
        if let Err(e) = active.writer.close() {
            error!(error = %e, "Error closing block writer");
        }
    }

    /// Final rollover at the end of the job
    pub async fn finish(&mut self) {
        self.rollover(RolloverReason::Finish).await;
    }

    /// Close the open block without flushing it. Its samples count as dropped.
    pub fn abort(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        warn!(samples = active.samples, "Discarding unflushed block");
        self.drop_samples(active.samples);
        if let Err(e) = active.writer.close() {
            error!(error = %e, "Error closing block writer");
        }
    }

    fn drop_sample(&self) {
        self.drop_samples(1);
    }

    fn drop_samples(&self, samples: u64) {
        if samples == 0 {
            return;
        }
        self.stats.record_drops(samples);
        telemetry::record_samples_dropped(samples);
    }
}
