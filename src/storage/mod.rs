//! Block storage
//!
//! The storage engine is reached through two capabilities: a [`BlockStore`]
//! opens write sessions, and a [`BlockWriter`] accepts
//! `(labels, timestamp, value)` tuples, commits them, and flushes them as one
//! immutable block. [`BlockWriterManager`] owns the single open session and
//! decides when to roll it over.

mod manager;
mod memory;
mod parquet_block;

pub use manager::{BlockWriterManager, RolloverReason};
pub use memory::{MemoryBlock, MemoryBlockStore};
pub use parquet_block::{ParquetBlockStore, BLOCK_DATA_FILE, BLOCK_META_FILE};

use crate::mapper::Labels;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Identifier of a flushed block
pub type BlockId = Uuid;

/// Opens block write sessions
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Open a session for a block spanning at most `block_duration_ms`
    async fn open(&self, block_duration_ms: i64) -> Result<Box<dyn BlockWriter>>;
}

/// One open block write session.
///
/// Appended samples are pending until `commit`; `flush` persists what was
/// committed. Sessions are not meant for concurrent writers.
#[async_trait]
pub trait BlockWriter: Send {
    fn append(&mut self, labels: &Labels, timestamp_ms: i64, value: f64) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    /// Persist committed samples. Returns `None` when there was nothing to write.
    async fn flush(&mut self) -> Result<Option<BlockMeta>>;

    fn close(&mut self) -> Result<()>;
}

/// Metadata written next to every block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_id: BlockId,
    /// Smallest sample timestamp, inclusive
    pub min_time: i64,
    /// Largest sample timestamp plus one
    pub max_time: i64,
    pub num_samples: u64,
    pub num_series: u64,
    /// Configured block duration the session was opened with
    pub duration_ms: i64,
}

impl BlockMeta {
    fn from_samples(block_id: BlockId, duration_ms: i64, samples: &[StoredSample]) -> Self {
        let min_time = samples.iter().map(|s| s.timestamp_ms).min().unwrap_or(0);
        let max_time = samples.iter().map(|s| s.timestamp_ms).max().unwrap_or(0);
        let series: HashSet<&Labels> = samples.iter().map(|s| &s.labels).collect();
        Self {
            block_id,
            min_time,
            max_time: max_time + 1,
            num_samples: samples.len() as u64,
            num_series: series.len() as u64,
            duration_ms,
        }
    }
}

/// A sample accepted by a block writer
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    pub labels: Labels,
    pub timestamp_ms: i64,
    pub value: f64,
}

/// Pending and committed samples of one write session
#[derive(Debug, Default)]
struct SessionBuffer {
    pending: Vec<StoredSample>,
    committed: Vec<StoredSample>,
    closed: bool,
}

impl SessionBuffer {
    fn append(&mut self, labels: &Labels, timestamp_ms: i64, value: f64) -> Result<()> {
        if self.closed {
            return Err(Error::Storage("append on a closed block writer".into()));
        }
        if labels.metric_name().is_none() {
            return Err(Error::Storage(format!(
                "sample without metric name: {}",
                labels
            )));
        }
        self.pending.push(StoredSample {
            labels: labels.clone(),
            timestamp_ms,
            value,
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Storage("commit on a closed block writer".into()));
        }
        self.committed.append(&mut self.pending);
        Ok(())
    }

    /// Committed samples ordered by series, then time
    fn take_committed(&mut self) -> Vec<StoredSample> {
        let mut samples = std::mem::take(&mut self.committed);
        samples.sort_by(|a, b| {
            a.labels
                .cmp(&b.labels)
                .then(a.timestamp_ms.cmp(&b.timestamp_ms))
        });
        samples
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Storage("block writer already closed".into()));
        }
        self.closed = true;
        self.pending.clear();
        self.committed.clear();
        Ok(())
    }
}

/// Counters shared between the block writer manager and progress reporting
#[derive(Debug, Default)]
pub struct BlockStats {
    samples_appended: AtomicU64,
    samples_dropped: AtomicU64,
    blocks_flushed: AtomicU64,
    rollovers: AtomicU64,
}

impl BlockStats {
    pub fn samples_appended(&self) -> u64 {
        self.samples_appended.load(Ordering::Relaxed)
    }

    pub fn samples_dropped(&self) -> u64 {
        self.samples_dropped.load(Ordering::Relaxed)
    }

    pub fn blocks_flushed(&self) -> u64 {
        self.blocks_flushed.load(Ordering::Relaxed)
    }

    pub fn rollovers(&self) -> u64 {
        self.rollovers.load(Ordering::Relaxed)
    }

    fn record_append(&self) {
        self.samples_appended.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drops(&self, samples: u64) {
        self.samples_dropped.fetch_add(samples, Ordering::Relaxed);
    }

    fn record_flush(&self) {
        self.blocks_flushed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rollover(&self) {
        self.rollovers.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(name: &str, id: &str) -> Labels {
        vec![
            ("__name__".to_string(), name.to_string()),
            ("ID".to_string(), id.to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_session_commit_and_sort() {
        let mut session = SessionBuffer::default();
        session.append(&labels("mem", "a"), 20, 1.0).unwrap();
        session.append(&labels("cpu", "a"), 30, 2.0).unwrap();
        session.append(&labels("cpu", "a"), 10, 3.0).unwrap();
        assert!(session.take_committed().is_empty());

        session.commit().unwrap();
        let samples = session.take_committed();
        let order: Vec<(Option<&str>, i64)> = samples
            .iter()
            .map(|s| (s.labels.metric_name(), s.timestamp_ms))
            .collect();
        assert_eq!(
            order,
            vec![(Some("cpu"), 10), (Some("cpu"), 30), (Some("mem"), 20)]
        );
    }

    #[test]
    fn test_session_rejects_unnamed_and_closed() {
        let mut session = SessionBuffer::default();
        assert!(session.append(&Labels::new(), 1, 1.0).is_err());
        session.close().unwrap();
        assert!(session.append(&labels("cpu", "a"), 1, 1.0).is_err());
        assert!(session.close().is_err());
    }

    #[test]
    fn test_block_meta_from_samples() {
        let samples = vec![
            StoredSample { labels: labels("cpu", "a"), timestamp_ms: 100, value: 1.0 },
            StoredSample { labels: labels("cpu", "a"), timestamp_ms: 300, value: 1.0 },
            StoredSample { labels: labels("cpu", "b"), timestamp_ms: 200, value: 1.0 },
        ];
        let meta = BlockMeta::from_samples(Uuid::nil(), 1_000, &samples);
        assert_eq!(meta.min_time, 100);
        assert_eq!(meta.max_time, 301);
        assert_eq!(meta.num_samples, 3);
        assert_eq!(meta.num_series, 2);
    }
}
