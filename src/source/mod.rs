//! Input records and the batch source capability
//!
//! A [`BatchSource`] turns an input file into a sequence of record batches,
//! one per row group. The pipeline only depends on this trait; the Parquet
//! implementation is [`ParquetSource`] and tests use [`MemorySource`].

mod memory;
mod parquet_source;

pub use memory::{MemorySource, ScriptedBatch};
pub use parquet_source::ParquetSource;

use crate::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File name fragment used to select input files
pub const PARQUET_MARKER: &str = ".parquet";

/// One decoded field value, aligned with the schema's field list
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    /// Values of a composite field's sub-fields, in schema order
    Composite(Vec<FieldValue>),
    /// Null in the source column
    Missing,
}

/// One row of input data
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Record identifier (empty when the schema has no id column)
    pub id: String,
    /// Observation time in seconds
    pub timestamp: i64,
    /// Field values in schema order
    pub values: Vec<FieldValue>,
    /// Labels supplied by the record itself; `None` when the record type
    /// has no additional labels
    pub labels: Option<BTreeMap<String, String>>,
}

/// A decoded row group
pub type Batch = Vec<SourceRecord>;

/// Lazily decoded batches of one file
pub type BatchIter = Box<dyn Iterator<Item = Result<Batch>> + Send>;

/// Capability yielding record batches for an input file.
///
/// `open` failures are fatal for the job; an `Err` item from the returned
/// iterator is a per-batch decode failure that abandons the rest of the file.
pub trait BatchSource: Send + Sync + 'static {
    /// Number of rows the file holds, read from metadata only
    fn count_rows(&self, path: &Path) -> Result<u64>;

    /// Open the file and decode it batch by batch
    fn open(&self, path: &Path) -> Result<BatchIter>;
}

/// Shift every record's timestamp by `offset_secs`, saturating at the
/// bounds of `i64`.
pub fn normalize_timestamps(batch: &mut [SourceRecord], offset_secs: i64) {
    for record in batch {
        record.timestamp = record.timestamp.saturating_add(offset_secs);
    }
}

/// Recursively list input files under `root`, sorted by path.
pub fn discover_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| {
            crate::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        let is_input = entry.file_type().is_file()
            && entry
                .file_name()
                .to_str()
                .map(|name| name.contains(PARQUET_MARKER))
                .unwrap_or(false);
        if is_input {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}
