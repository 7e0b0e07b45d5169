//! In-memory block store for tests and dry runs

use super::{BlockMeta, BlockStore, BlockWriter, SessionBuffer, StoredSample};
use crate::mapper::Labels;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// A flushed block with its samples ordered by series, then time
#[derive(Debug, Clone)]
pub struct MemoryBlock {
    pub meta: BlockMeta,
    pub samples: Vec<StoredSample>,
}

/// Keeps flushed blocks in memory. Clones share the same blocks.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<Mutex<Vec<MemoryBlock>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flushed blocks in flush order
    pub fn blocks(&self) -> Vec<MemoryBlock> {
        self.blocks.lock().clone()
    }

    /// Every stored sample across all blocks
    pub fn samples(&self) -> Vec<StoredSample> {
        self.blocks
            .lock()
            .iter()
            .flat_map(|b| b.samples.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn open(&self, block_duration_ms: i64) -> Result<Box<dyn BlockWriter>> {
        if block_duration_ms <= 0 {
            return Err(Error::Config(format!(
                "block duration must be positive, got {}ms",
                block_duration_ms
            )));
        }
        Ok(Box::new(MemoryBlockWriter {
            blocks: Arc::clone(&self.blocks),
            block_duration_ms,
            session: SessionBuffer::default(),
        }))
    }
}

struct MemoryBlockWriter {
    blocks: Arc<Mutex<Vec<MemoryBlock>>>,
    block_duration_ms: i64,
    session: SessionBuffer,
}

#[async_trait]
impl BlockWriter for MemoryBlockWriter {
    fn append(&mut self, labels: &Labels, timestamp_ms: i64, value: f64) -> Result<()> {
        self.session.append(labels, timestamp_ms, value)
    }

    fn commit(&mut self) -> Result<()> {
        self.session.commit()
    }

    async fn flush(&mut self) -> Result<Option<BlockMeta>> {
        if self.session.closed {
            return Err(Error::Storage("flush on a closed block writer".into()));
        }
        let samples = self.session.take_committed();
        if samples.is_empty() {
            return Ok(None);
        }
        let meta = BlockMeta::from_samples(Uuid::new_v4(), self.block_duration_ms, &samples);
        self.blocks.lock().push(MemoryBlock {
            meta: meta.clone(),
            samples,
        });
        Ok(Some(meta))
    }

    fn close(&mut self) -> Result<()> {
        self.session.close()
    }
}
