//! Error types for the backfill pipeline

use std::fmt;

/// Result type alias for backfill operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the backfill pipeline
#[derive(Debug)]
pub enum Error {
    /// Arrow-related errors
    Arrow(arrow::error::ArrowError),
    /// Parquet-related errors
    Parquet(parquet::errors::ParquetError),
    /// Object store errors
    ObjectStore(object_store::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Invalid record schema or input column layout
    InvalidSchema(String),
    /// A field is tagged with a metric type the mapper cannot represent
    UnsupportedMetricType { field: String, metric_type: String },
    /// Storage engine errors (append, commit, flush, close)
    Storage(String),
    /// The job was cancelled before it completed
    Cancelled,
    /// Internal error
    Internal(String),
}

impl Error {
    /// Whether this error aborts the whole job.
    ///
    /// Storage errors are logged and the affected sample or block is
    /// abandoned. Row-group decode errors are recovered inside the reader
    /// that hits them. The coordinator cancels the job on any other error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Storage(_))
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Arrow(e) => Some(e),
            Error::Parquet(e) => Some(e),
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Arrow(e) => write!(f, "Arrow error: {}", e),
            Error::Parquet(e) => write!(f, "Parquet error: {}", e),
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::InvalidSchema(msg) => write!(f, "Invalid schema: {}", msg),
            Error::UnsupportedMetricType { field, metric_type } => write!(
                f,
                "Unsupported metric type '{}' on field '{}'",
                metric_type, field
            ),
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
            Error::Cancelled => write!(f, "Backfill cancelled"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(e: arrow::error::ArrowError) -> Self {
        Error::Arrow(e)
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Error::Parquet(e)
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
