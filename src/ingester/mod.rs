//! Backfill pipeline
//!
//! The pipeline moves rows from input files into storage blocks:
//! - Reader tasks decode files row group by row group, at most
//!   `reader_concurrency` files at a time, and push batches into a bounded
//!   channel
//! - Mapping workers, at most `marshal_concurrency` at a time, turn each
//!   batch into sample rows and insert them into the ordering buffer
//! - When the buffer holds `drain_threshold` rows it is swapped for an empty
//!   one under its lock, and the old buffer is drained in timestamp order
//!   into the block writer manager outside that lock
//! - At end of stream the buffer is drained once more and the last block is
//!   flushed
//!
//! Rows drained together reach storage in non-decreasing timestamp order.
//! Two drains may interleave at the writer lock in either order.

mod buffer;
pub mod progress;
pub mod telemetry;

pub use buffer::{Drain, OrderingBuffer};
pub use progress::{run_status_loop, PipelineState, ProgressSnapshot};

use crate::config::BackfillConfig;
use crate::mapper::MetricMapper;
use crate::schema::RecordSchema;
use crate::source::{normalize_timestamps, Batch, BatchSource};
use crate::storage::{BlockMeta, BlockStore, BlockWriterManager};
use crate::{Error, Result};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a completed backfill
#[derive(Debug, Clone)]
pub struct BackfillSummary {
    /// Rows expected after abandoned rows were subtracted
    pub rows_total: u64,
    pub rows_done: u64,
    pub rows_dropped: u64,
    pub samples_appended: u64,
    pub samples_dropped: u64,
    pub blocks: Vec<BlockMeta>,
}

/// Backfill job coordinator
pub struct Backfill {
    pipeline: Arc<Pipeline>,
}

/// State shared by reader tasks, mapping workers and the drain path
struct Pipeline {
    config: BackfillConfig,
    source: Arc<dyn BatchSource>,
    mapper: MetricMapper,
    /// Held around inserts and around the swap that starts a drain
    buffer: parking_lot::Mutex<OrderingBuffer>,
    writer: Mutex<BlockWriterManager>,
    state: Arc<PipelineState>,
    shutdown: CancellationToken,
}

impl Backfill {
    /// Create a job. Fails on invalid configuration or an unmappable schema.
    pub fn new(
        config: BackfillConfig,
        schema: &RecordSchema,
        source: Arc<dyn BatchSource>,
        store: Arc<dyn BlockStore>,
    ) -> Result<Self> {
        config.validate()?;
        let mapper = MetricMapper::new(schema)?;
        let writer = BlockWriterManager::new(
            store,
            config.block_duration_ms(),
            config.max_samples_per_block,
        );
        let state = Arc::new(PipelineState::new(writer.stats()));

        Ok(Self {
            pipeline: Arc::new(Pipeline {
                config,
                source,
                mapper,
                buffer: parking_lot::Mutex::new(OrderingBuffer::new()),
                writer: Mutex::new(writer),
                state,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Progress counters, readable while the job runs
    pub fn state(&self) -> Arc<PipelineState> {
        Arc::clone(&self.pipeline.state)
    }

    /// Token that aborts the job when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.pipeline.shutdown.clone()
    }

    /// Run the job over `files` to completion.
    ///
    /// Returns the first fatal error, after discarding the open block.
    /// Recoverable failures (undecodable row groups, rejected samples,
    /// failed block flushes) are logged and counted in the summary.
    pub async fn run(&self, files: &[PathBuf]) -> Result<BackfillSummary> {
        let pipeline = &self.pipeline;
        let files = pipeline.count_rows(files.to_vec()).await?;
        let total: u64 = files.iter().map(|(_, rows)| rows).sum();
        pipeline.state.set_total(total);
        info!(files = files.len(), rows = total, "Starting backfill");

        let reporter_token = pipeline.shutdown.child_token();
        let reporter = tokio::spawn(run_status_loop(
            Arc::clone(&pipeline.state),
            pipeline.config.status_interval,
            reporter_token.clone(),
        ));

        let (tx, rx) = mpsc::channel(pipeline.config.channel_capacity);
        let (read_result, consume_result) =
            tokio::join!(pipeline.read_files(files, tx), pipeline.consume(rx));
        reporter_token.cancel();
        if let Err(e) = reporter.await {
            warn!(error = %e, "Status reporter task failed");
        }

        let outcome = read_result.and(consume_result).and_then(|()| {
            if pipeline.shutdown.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                Ok(())
            }
        });
        if let Err(e) = outcome {
            pipeline.writer.lock().await.abort();
            return Err(e);
        }

        let mut writer = pipeline.writer.lock().await;
        writer.finish().await;
        let stats = writer.stats();
        let summary = BackfillSummary {
            rows_total: pipeline.state.total(),
            rows_done: pipeline.state.done(),
            rows_dropped: pipeline.state.rows_dropped(),
            samples_appended: stats.samples_appended(),
            samples_dropped: stats.samples_dropped(),
            blocks: writer.flushed_blocks().to_vec(),
        };
        info!(
            rows = summary.rows_done,
            rows_dropped = summary.rows_dropped,
            samples = summary.samples_appended,
            samples_dropped = summary.samples_dropped,
            blocks = summary.blocks.len(),
            "Backfill complete"
        );
        Ok(summary)
    }
}

impl Pipeline {
    /// Read row counts from file metadata. Any failure is fatal.
    async fn count_rows(&self, files: Vec<PathBuf>) -> Result<Vec<(PathBuf, u64)>> {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || {
            files
                .into_iter()
                .map(|path| {
                    let rows = source.count_rows(&path)?;
                    debug!(path = %path.display(), rows, "Counted rows");
                    Ok((path, rows))
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| Error::Internal(format!("row count task failed: {}", e)))?
    }

    /// Dispatch one reader per file, bounded by the reader semaphore, then
    /// close the channel once every reader has released its permit.
    ///
    /// A reader that fails cancels the job before it returns its permit, so
    /// no further file is dispatched after a fatal error.
    async fn read_files(&self, files: Vec<(PathBuf, u64)>, tx: mpsc::Sender<Batch>) -> Result<()> {
        let limit = self.config.reader_concurrency;
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut readers = JoinSet::new();
        let mut first_error = None;

        for (path, rows) in files {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|_| Error::Internal("reader semaphore closed".into()))?,
            };
            if self.shutdown.is_cancelled() {
                break;
            }
            let source = Arc::clone(&self.source);
            let state = Arc::clone(&self.state);
            let shutdown = self.shutdown.clone();
            let tx = tx.clone();
            let offset = self.config.timestamp_offset_secs;

            readers.spawn_blocking(move || {
                let _permit = permit;
                let result =
                    read_file(source.as_ref(), &path, rows, offset, &tx, &state, &shutdown);
                if let Err(e) = &result {
                    if e.is_fatal() {
                        error!(
                            path = %path.display(),
                            error = %e,
                            "Reader failed, cancelling backfill"
                        );
                        shutdown.cancel();
                    }
                }
                result
            });

            while let Some(joined) = readers.try_join_next() {
                self.note_task_result("reader", joined, &mut first_error);
            }
        }

        // join barrier: every permit back means every reader has returned
        let _all = semaphore
            .acquire_many(limit as u32)
            .await
            .map_err(|_| Error::Internal("reader semaphore closed".into()))?;
        drop(tx);
        debug!("All readers finished, input channel closed");

        while let Some(joined) = readers.join_next().await {
            self.note_task_result("reader", joined, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Map batches from the channel, bounded by the marshal semaphore, then
    /// force the final drain once the channel is closed and all workers are done.
    async fn consume(self: &Arc<Self>, mut rx: mpsc::Receiver<Batch>) -> Result<()> {
        let limit = self.config.marshal_concurrency;
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut workers = JoinSet::new();
        let mut first_error = None;

        loop {
            let batch = tokio::select! {
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            };
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|_| Error::Internal("marshal semaphore closed".into()))?,
                _ = self.shutdown.cancelled() => break,
            };

            let pipeline = Arc::clone(self);
            workers.spawn(async move {
                let _permit = permit;
                pipeline.process_batch(batch).await
            });

            while let Some(joined) = workers.try_join_next() {
                self.note_task_result("mapping worker", joined, &mut first_error);
            }
        }
        // unblock readers still waiting on a full channel
        drop(rx);

        let _all = semaphore
            .acquire_many(limit as u32)
            .await
            .map_err(|_| Error::Internal("marshal semaphore closed".into()))?;
        while let Some(joined) = workers.join_next().await {
            self.note_task_result("mapping worker", joined, &mut first_error);
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if !self.shutdown.is_cancelled() {
            self.drain_and_store(true).await;
        }
        Ok(())
    }

    /// Map one batch and insert its rows, draining first whenever the buffer is full
    async fn process_batch(&self, batch: Batch) -> Result<()> {
        self.drain_and_store(false).await;

        let rows = self.mapper.map_batch(&batch)?;
        for row in rows {
            let full = {
                let mut buffer = self.buffer.lock();
                let full = (buffer.len() >= self.config.drain_threshold)
                    .then(|| std::mem::take(&mut *buffer));
                buffer.insert(row);
                full
            };
            if let Some(full) = full {
                self.store_rows(full).await;
            }
        }

        self.state.add_done(batch.len() as u64);
        Ok(())
    }

    /// Swap the buffer out if it crossed the threshold (or unconditionally
    /// when forced) and hand its rows to the block writer manager.
    async fn drain_and_store(&self, force: bool) {
        let drained = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() || (!force && buffer.len() < self.config.drain_threshold) {
                return;
            }
            std::mem::take(&mut *buffer)
        };
        self.store_rows(drained).await;
    }

    async fn store_rows(&self, rows: OrderingBuffer) {
        let started = Instant::now();
        let row_count = rows.len() as u64;
        let mut appended = 0u64;

        let mut writer = self.writer.lock().await;
        for row in rows {
            for sample in row.into_samples() {
                if writer
                    .append(&sample.labels, sample.timestamp_ms, sample.value)
                    .await
                {
                    appended += 1;
                }
            }
        }
        drop(writer);

        telemetry::record_drain(started.elapsed(), row_count);
        debug!(
            rows = row_count,
            samples = appended,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Drained ordering buffer"
        );
    }

    /// Keep the first fatal task error and cancel the job on it.
    /// Recoverable errors are only logged.
    fn note_task_result(
        &self,
        task: &str,
        joined: std::result::Result<Result<()>, JoinError>,
        first_error: &mut Option<Error>,
    ) {
        let result =
            joined.unwrap_or_else(|e| Err(Error::Internal(format!("{} task failed: {}", task, e))));
        match result {
            Ok(()) => {}
            Err(e) if !e.is_fatal() => {
                warn!(task, error = %e, "Backfill task hit a recoverable error");
            }
            Err(e) => {
                error!(task, error = %e, "Backfill task failed");
                self.shutdown.cancel();
                first_error.get_or_insert(e);
            }
        }
    }
}

/// Read one file and send its batches downstream.
///
/// A batch that fails to decode abandons the rest of the file; its unread
/// rows are taken off the job total. Failing to open the file is fatal.
fn read_file(
    source: &dyn BatchSource,
    path: &Path,
    file_rows: u64,
    offset_secs: i64,
    tx: &mpsc::Sender<Batch>,
    state: &PipelineState,
    shutdown: &CancellationToken,
) -> Result<()> {
    let batches = source.open(path)?;
    let mut sent = 0u64;

    for item in batches {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        match item {
            Ok(mut batch) => {
                normalize_timestamps(&mut batch, offset_secs);
                let rows = batch.len() as u64;
                if tx.blocking_send(batch).is_err() {
                    debug!(path = %path.display(), "Consumer gone, stopping reader");
                    return Ok(());
                }
                sent += rows;
            }
            Err(e) => {
                let remaining = file_rows.saturating_sub(sent);
                error!(
                    path = %path.display(),
                    error = %e,
                    rows_dropped = remaining,
                    "Failed to decode row group, abandoning file"
                );
                state.abandon_rows(remaining);
                telemetry::record_rows_dropped(remaining);
                return Ok(());
            }
        }
    }

    if sent < file_rows {
        warn!(
            path = %path.display(),
            expected = file_rows,
            read = sent,
            "File yielded fewer rows than its metadata"
        );
        state.abandon_rows(file_rows - sent);
    }
    debug!(path = %path.display(), rows = sent, "Finished reading file");
    Ok(())
}
