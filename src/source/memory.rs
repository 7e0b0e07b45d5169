//! In-memory batch source for tests and dry runs

use super::{Batch, BatchIter, BatchSource};
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One scripted step of a file
#[derive(Debug, Clone)]
pub enum ScriptedBatch {
    /// A successfully decoded row group
    Records(Batch),
    /// A row group of `rows` rows that fails to decode
    DecodeError { rows: u64, message: String },
}

impl ScriptedBatch {
    fn rows(&self) -> u64 {
        match self {
            ScriptedBatch::Records(batch) => batch.len() as u64,
            ScriptedBatch::DecodeError { rows, .. } => *rows,
        }
    }
}

/// Batch source backed by pre-built record batches keyed by path
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<PathBuf, Vec<ScriptedBatch>>,
    /// Files whose metadata reports a row count but that fail to open
    unreadable: HashMap<PathBuf, u64>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file whose row groups all decode successfully
    pub fn with_file(self, path: impl Into<PathBuf>, batches: Vec<Batch>) -> Self {
        self.with_script(path, batches.into_iter().map(ScriptedBatch::Records).collect())
    }

    /// Register a file with an explicit script of outcomes
    pub fn with_script(mut self, path: impl Into<PathBuf>, script: Vec<ScriptedBatch>) -> Self {
        self.files.insert(path.into(), script);
        self
    }

    /// Register a file that counts `rows` rows but cannot be opened
    pub fn with_unreadable(mut self, path: impl Into<PathBuf>, rows: u64) -> Self {
        self.unreadable.insert(path.into(), rows);
        self
    }

    /// Registered paths, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .files
            .keys()
            .chain(self.unreadable.keys())
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    fn script(&self, path: &Path) -> Result<&Vec<ScriptedBatch>> {
        self.files.get(path).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such input: {}", path.display()),
            ))
        })
    }
}

impl BatchSource for MemorySource {
    fn count_rows(&self, path: &Path) -> Result<u64> {
        if let Some(rows) = self.unreadable.get(path) {
            return Ok(*rows);
        }
        Ok(self.script(path)?.iter().map(ScriptedBatch::rows).sum())
    }

    fn open(&self, path: &Path) -> Result<BatchIter> {
        if self.unreadable.contains_key(path) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("cannot open input: {}", path.display()),
            )));
        }
        let script = self.script(path)?.clone();
        Ok(Box::new(script.into_iter().map(|step| match step {
            ScriptedBatch::Records(batch) => Ok(batch),
            ScriptedBatch::DecodeError { message, .. } => Err(Error::Parquet(
                parquet::errors::ParquetError::General(message),
            )),
        })))
    }
}
