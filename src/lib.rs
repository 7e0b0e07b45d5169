//! # tsdb-backfill
//!
//! Bulk historical backfill of columnar snapshot records into time-windowed
//! TSDB blocks.
//!
//! Input files hold rows of snapshot records (a timestamp, an identifier, and
//! a set of numeric measurements). A declarative [`schema::RecordSchema`]
//! says which columns become metrics, of which type, under which name, and
//! with which labels. The backfill turns every row into samples and writes
//! them into immutable blocks that each cover a bounded time window.
//!
//! ## Pipeline
//!
//! - **Readers**: decode files row group by row group with bounded parallelism
//! - **Mapper**: converts records into labelled samples from the schema's tags
//! - **Ordering buffer**: re-sorts rows by timestamp between drains
//! - **Block writer manager**: appends samples, rolls blocks over on time
//!   window or sample count, and flushes them to object storage

pub mod config;
pub mod ingester;
pub mod mapper;
pub mod schema;
pub mod source;
pub mod storage;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::{BackfillConfig, ComponentFactory};
    pub use crate::ingester::{Backfill, BackfillSummary, PipelineState};
    pub use crate::mapper::{Labels, MetricMapper, MetricSample, SampleRow};
    pub use crate::schema::{FieldDescriptor, MetricKind, RecordSchema};
    pub use crate::source::{BatchSource, FieldValue, ParquetSource, SourceRecord};
    pub use crate::storage::{BlockStore, BlockWriter, BlockWriterManager, ParquetBlockStore};
    pub use crate::{Error, Result};
}
