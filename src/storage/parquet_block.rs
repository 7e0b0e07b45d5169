//! Parquet blocks on object storage
//!
//! Each flushed block becomes a directory `<prefix>/<block_id>/` holding one
//! Parquet file of samples and a JSON metadata file. Samples are stored with
//! labels as columns: `timestamp`, `metric_name`, one nullable string column
//! per label name seen in the block, and `value_f64`.

use super::{BlockMeta, BlockStore, BlockWriter, SessionBuffer, StoredSample};
use crate::mapper::{Labels, METRIC_NAME_LABEL};
use crate::{Error, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray, TimestampMillisecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties, WriterVersion};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Sample data file inside a block directory
pub const BLOCK_DATA_FILE: &str = "chunk.parquet";
/// Metadata file inside a block directory
pub const BLOCK_META_FILE: &str = "meta.json";

const TIMESTAMP_COLUMN: &str = "timestamp";
const METRIC_NAME_COLUMN: &str = "metric_name";
const VALUE_COLUMN: &str = "value_f64";
const RESERVED_PREFIX: &str = "label_";

/// Block store writing Parquet blocks to any [`ObjectStore`]
#[derive(Clone)]
pub struct ParquetBlockStore {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    props: WriterProperties,
}

impl ParquetBlockStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: Path::default(),
            props: build_writer_properties(),
        }
    }

    /// Place blocks under `prefix` instead of the store root
    pub fn with_prefix(mut self, prefix: impl Into<Path>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Directory of block `block_id`
    pub fn block_path(&self, block_id: &Uuid) -> Path {
        self.prefix.child(block_id.to_string())
    }
}

#[async_trait]
impl BlockStore for ParquetBlockStore {
    async fn open(&self, block_duration_ms: i64) -> Result<Box<dyn BlockWriter>> {
        if block_duration_ms <= 0 {
            return Err(Error::Config(format!(
                "block duration must be positive, got {}ms",
                block_duration_ms
            )));
        }
        Ok(Box::new(ParquetBlockWriter {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
            props: self.props.clone(),
            block_duration_ms,
            session: SessionBuffer::default(),
        }))
    }
}

/// Writer settings for sample blocks
fn build_writer_properties() -> WriterProperties {
    let builder = WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        // labels repeat heavily within a block
        .set_dictionary_enabled(true)
        .set_dictionary_page_size_limit(1_000_000)
        .set_max_row_group_size(500_000)
        .set_statistics_enabled(EnabledStatistics::Page)
        .set_bloom_filter_enabled(false)
        .set_data_page_size_limit(1024 * 1024);
    let compression = ZstdLevel::try_new(3)
        .map(Compression::ZSTD)
        .unwrap_or(Compression::SNAPPY);
    builder.set_compression(compression).build()
}

struct ParquetBlockWriter {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    props: WriterProperties,
    block_duration_ms: i64,
    session: SessionBuffer,
}

#[async_trait]
impl BlockWriter for ParquetBlockWriter {
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
        let batch = samples_to_batch(&samples)?;
        let data = write_parquet(&batch, &self.props)?;
        let meta_json = serde_json::to_vec_pretty(&meta)?;

        let dir = self.prefix.child(meta.block_id.to_string());
        let data_len = data.len();
        self.store
            .put(&dir.child(BLOCK_DATA_FILE), PutPayload::from(data))
            .await?;
        self.store
            .put(&dir.child(BLOCK_META_FILE), PutPayload::from(meta_json))
            .await?;

        debug!(
            path = %dir,
            bytes = data_len,
            rows = batch.num_rows(),
            "Uploaded block"
        );
        Ok(Some(meta))
    }

    fn close(&mut self) -> Result<()> {
        self.session.close()
    }
}

/// Column name for label `name`, prefixed when it clashes with a fixed column
pub fn label_column_name(name: &str) -> String {
    match name {
        TIMESTAMP_COLUMN | METRIC_NAME_COLUMN | VALUE_COLUMN => {
            format!("{}{}", RESERVED_PREFIX, name)
        }
        _ => name.to_string(),
    }
}

/// Lay out samples with one column per label name
fn samples_to_batch(samples: &[StoredSample]) -> Result<RecordBatch> {
    let label_names: BTreeSet<&str> = samples
        .iter()
        .flat_map(|s| s.labels.iter())
        .map(|l| l.name.as_str())
        .filter(|name| *name != METRIC_NAME_LABEL)
        .collect();

    let mut fields = vec![
        Field::new(
            TIMESTAMP_COLUMN,
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
        Field::new(METRIC_NAME_COLUMN, DataType::Utf8, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(
            TimestampMillisecondArray::from_iter_values(samples.iter().map(|s| s.timestamp_ms))
                .with_timezone("UTC"),
        ),
        Arc::new(StringArray::from_iter_values(
            samples.iter().map(|s| s.labels.metric_name().unwrap_or_default()),
        )),
    ];

    for name in &label_names {
        let column_name = label_column_name(name);
        if fields.iter().any(|f| f.name() == &column_name) {
            return Err(Error::InvalidSchema(format!(
                "label '{}' collides with column '{}'",
                name, column_name
            )));
        }
        fields.push(Field::new(column_name, DataType::Utf8, true));
        let values: StringArray = samples.iter().map(|s| s.labels.get(name)).collect();
        columns.push(Arc::new(values));
    }

    fields.push(Field::new(VALUE_COLUMN, DataType::Float64, false));
    columns.push(Arc::new(Float64Array::from_iter_values(
        samples.iter().map(|s| s.value),
    )));

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

fn write_parquet(batch: &RecordBatch, props: &WriterProperties) -> Result<Bytes> {
    let mut buffer = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props.clone()))?;
        writer.write(batch)?;
        writer.close()?;
    }
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;
    use object_store::memory::InMemory;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    /// Every object one directory level down, sorted
    async fn collect_paths(store: &dyn ObjectStore) -> Vec<Path> {
        let dirs = store.list_with_delimiter(None).await.unwrap().common_prefixes;
        let mut files = Vec::new();
        for dir in dirs {
            let listing = store.list_with_delimiter(Some(&dir)).await.unwrap();
            files.extend(listing.objects.into_iter().map(|o| o.location));
        }
        files.sort();
        files
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_label_column_name() {
        assert_eq!(label_column_name("ID"), "ID");
        assert_eq!(label_column_name("timestamp"), "label_timestamp");
        assert_eq!(label_column_name("value_f64"), "label_value_f64");
    }

    #[test]
    fn test_samples_to_batch_layout() {
        let samples = vec![
            StoredSample {
                labels: labels(&[("__name__", "cpu"), ("ID", "c_1")]),
                timestamp_ms: 1_000,
                value: 0.5,
            },
            StoredSample {
                labels: labels(&[("__name__", "mem"), ("unit", "bytes")]),
                timestamp_ms: 2_000,
                value: 42.0,
            },
        ];
        let batch = samples_to_batch(&samples).unwrap();
        let names: Vec<&str> = batch
            .schema_ref()
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect();
        assert_eq!(names, vec!["timestamp", "metric_name", "ID", "unit", "value_f64"]);

        let ids = batch
            .column(2)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(ids.value(0), "c_1");
        assert!(ids.is_null(1));
    }

    #[tokio::test]
    async fn test_flush_writes_data_and_meta() {
        let object_store = Arc::new(InMemory::new());
        let store = ParquetBlockStore::new(object_store.clone());
        let mut writer = store.open(7_200_000).await.unwrap();

        writer
            .append(&labels(&[("__name__", "cpu"), ("ID", "c_1")]), 2_000, 1.0)
            .unwrap();
        writer
            .append(&labels(&[("__name__", "cpu"), ("ID", "c_1")]), 1_000, 2.0)
            .unwrap();
        writer.commit().unwrap();
        let meta = writer.flush().await.unwrap().unwrap();
        writer.close().unwrap();

        assert_eq!(meta.min_time, 1_000);
        assert_eq!(meta.max_time, 2_001);
        assert_eq!(meta.num_samples, 2);
        assert_eq!(meta.num_series, 1);

        let paths = collect_paths(object_store.as_ref()).await;
        let dir = store.block_path(&meta.block_id);
        assert_eq!(
            paths,
            vec![dir.child(BLOCK_DATA_FILE), dir.child(BLOCK_META_FILE)]
        );

        let raw = object_store
            .get(&dir.child(BLOCK_META_FILE))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let stored: BlockMeta = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored, meta);

        let data = object_store
            .get(&dir.child(BLOCK_DATA_FILE))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let mut reader = ParquetRecordBatchReaderBuilder::try_new(data)
            .unwrap()
            .build()
            .unwrap();
        let batch = reader.next().unwrap().unwrap();
        assert_eq!(batch.num_rows(), 2);
        let ts = batch
            .column(0)
            .as_any()
            .downcast_ref::<TimestampMillisecondArray>()
            .unwrap();
        assert_eq!(ts.values().to_vec(), vec![1_000, 2_000]);
    }

    #[tokio::test]
    async fn test_flush_without_commit_is_empty() {
        let object_store = Arc::new(InMemory::new());
        let store = ParquetBlockStore::new(object_store.clone());
        let mut writer = store.open(1_000).await.unwrap();
        writer.append(&labels(&[("__name__", "cpu")]), 1, 1.0).unwrap();

        assert!(writer.flush().await.unwrap().is_none());
        assert!(collect_paths(object_store.as_ref()).await.is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_non_positive_duration() {
        let store = ParquetBlockStore::new(Arc::new(InMemory::new()));
        assert!(store.open(0).await.is_err());
    }
}
