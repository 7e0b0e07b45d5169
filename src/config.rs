//! Backfill configuration and environment-based component factory

use crate::storage::{BlockStore, ParquetBlockStore};
use crate::{Error, Result};
use object_store::{local::LocalFileSystem, memory::InMemory, ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Unix seconds of 2020-03-01T00:00:00Z
pub const DEFAULT_TIMESTAMP_OFFSET_SECS: i64 = 1_583_020_800;

/// Configuration for one backfill job
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Maximum time span of one block
    pub block_duration: Duration,
    /// Samples per block before it is rolled over
    pub max_samples_per_block: u64,
    /// Buffered rows that trigger a drain into the block writer
    pub drain_threshold: usize,
    /// Batches in flight between readers and mapping workers
    pub channel_capacity: usize,
    /// Files read concurrently
    pub reader_concurrency: usize,
    /// Batches mapped concurrently
    pub marshal_concurrency: usize,
    /// Added to every record timestamp (seconds) before mapping
    pub timestamp_offset_secs: i64,
    /// Period of the progress report
    pub status_interval: Duration,
    /// Root directory scanned for input files
    pub input_path: PathBuf,
    /// Directory blocks are written under
    pub output_path: PathBuf,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            block_duration: Duration::from_secs(8 * 24 * 3600), // 8 days
            max_samples_per_block: 100_000_000,
            drain_threshold: 1_000,
            channel_capacity: 64,
            reader_concurrency: 40,
            marshal_concurrency: 32,
            timestamp_offset_secs: DEFAULT_TIMESTAMP_OFFSET_SECS,
            status_interval: Duration::from_secs(10),
            input_path: PathBuf::from("."),
            output_path: PathBuf::from("data"),
        }
    }
}

impl BackfillConfig {
    /// Block duration in milliseconds, saturating at `i64::MAX`
    pub fn block_duration_ms(&self) -> i64 {
        i64::try_from(self.block_duration.as_millis()).unwrap_or(i64::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_duration_ms() <= 0 {
            return Err(Error::Config(
                "block_duration must be at least one millisecond".to_string(),
            ));
        }
        let counts = [
            ("max_samples_per_block", self.max_samples_per_block as usize),
            ("drain_threshold", self.drain_threshold),
            ("channel_capacity", self.channel_capacity),
            ("reader_concurrency", self.reader_concurrency),
            ("marshal_concurrency", self.marshal_concurrency),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        // semaphores hand out u32 permits
        if self.reader_concurrency > u32::MAX as usize || self.marshal_concurrency > u32::MAX as usize {
            return Err(Error::Config("concurrency limits must fit in u32".to_string()));
        }
        if self.status_interval.is_zero() {
            return Err(Error::Config("status_interval must be positive".to_string()));
        }
        Ok(())
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the block store from environment
    ///
    /// Environment variables:
    /// - STORAGE_BACKEND: "local" (default) writes under `output_path`, "memory" is a dry run
    pub fn create_block_store(config: &BackfillConfig) -> Result<Arc<dyn BlockStore>> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "local".to_string());
        Self::create_block_store_for(&backend, config)
    }

    /// Create the block store for a named backend
    pub fn create_block_store_for(
        backend: &str,
        config: &BackfillConfig,
    ) -> Result<Arc<dyn BlockStore>> {
        let object_store: Arc<dyn ObjectStore> = match backend {
            "local" => {
                std::fs::create_dir_all(&config.output_path)?;
                info!(path = %config.output_path.display(), "Writing blocks to local filesystem");
                Arc::new(LocalFileSystem::new_with_prefix(&config.output_path)?)
            }
            "memory" => {
                info!("Using in-memory block storage (dry run)");
                Arc::new(InMemory::new())
            }
            _ => {
                return Err(Error::Config(format!(
                    "Unknown STORAGE_BACKEND: {}. Use 'local' or 'memory'",
                    backend
                )))
            }
        };
        Ok(Arc::new(ParquetBlockStore::new(object_store)))
    }
}
