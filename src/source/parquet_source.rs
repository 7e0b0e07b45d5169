//! Parquet batch source
//!
//! Each row group is decoded into one batch of [`SourceRecord`]s using the
//! record schema to locate the timestamp, id, label and field columns.

use super::{Batch, BatchIter, BatchSource, FieldValue, SourceRecord};
use crate::schema::{FieldDescriptor, FieldKind, RecordSchema};
use crate::{Error, Result};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type};
use arrow_array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray, StructArray};
use arrow_schema::DataType;
use parquet::arrow::arrow_reader::{
    ArrowReaderMetadata, ArrowReaderOptions, ParquetRecordBatchReaderBuilder,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Reads Parquet files laid out according to a [`RecordSchema`]
#[derive(Debug, Clone)]
pub struct ParquetSource {
    schema: Arc<RecordSchema>,
}

impl ParquetSource {
    pub fn new(schema: Arc<RecordSchema>) -> Self {
        Self { schema }
    }

    fn load_metadata(file: &File) -> Result<ArrowReaderMetadata> {
        Ok(ArrowReaderMetadata::load(file, ArrowReaderOptions::default())?)
    }
}

impl BatchSource for ParquetSource {
    fn count_rows(&self, path: &Path) -> Result<u64> {
        let file = File::open(path)?;
        let metadata = Self::load_metadata(&file)?;
        Ok(metadata.metadata().file_metadata().num_rows().max(0) as u64)
    }

    fn open(&self, path: &Path) -> Result<BatchIter> {
        let file = File::open(path)?;
        let metadata = Self::load_metadata(&file)?;
        debug!(
            path = %path.display(),
            row_groups = metadata.metadata().num_row_groups(),
            "Opened parquet file"
        );
        Ok(Box::new(RowGroupBatches {
            path: path.to_path_buf(),
            file,
            metadata,
            schema: Arc::clone(&self.schema),
            next_row_group: 0,
        }))
    }
}

/// Iterator decoding one row group per step
struct RowGroupBatches {
    path: PathBuf,
    file: File,
    metadata: ArrowReaderMetadata,
    schema: Arc<RecordSchema>,
    next_row_group: usize,
}

impl RowGroupBatches {
    fn read_row_group(&self, row_group: usize) -> Result<Batch> {
        let rows = self.metadata.metadata().row_group(row_group).num_rows().max(1) as usize;
        let reader = ParquetRecordBatchReaderBuilder::new_with_metadata(
            self.file.try_clone()?,
            self.metadata.clone(),
        )
        .with_row_groups(vec![row_group])
        .with_batch_size(rows)
        .build()?;

        let mut records = Vec::with_capacity(rows);
        for batch in reader {
            records.extend(decode_batch(&self.schema, &batch?)?);
        }
        debug!(
            path = %self.path.display(),
            row_group,
            rows = records.len(),
            "Decoded row group"
        );
        Ok(records)
    }
}

impl Iterator for RowGroupBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_row_group >= self.metadata.metadata().num_row_groups() {
            return None;
        }
        let row_group = self.next_row_group;
        self.next_row_group += 1;
        Some(self.read_row_group(row_group))
    }
}

/// Decode an Arrow record batch into source records.
pub fn decode_batch(schema: &RecordSchema, batch: &RecordBatch) -> Result<Batch> {
    let timestamps = int_array(
        batch_column(batch, &schema.timestamp_column)?,
        &schema.timestamp_column,
    )?;
    let ids = schema
        .id_column
        .as_deref()
        .map(|column| string_array(batch_column(batch, column)?, column))
        .transpose()?;
    let labels = schema
        .label_columns
        .iter()
        .map(|lc| Ok((lc.label.as_str(), string_array(batch_column(batch, &lc.column)?, &lc.column)?)))
        .collect::<Result<Vec<_>>>()?;
    let decoders = schema
        .fields
        .iter()
        .map(|field| ColumnDecoder::new(batch_column(batch, field.column_name())?, field))
        .collect::<Result<Vec<_>>>()?;

    let has_labels = schema.has_additional_labels();
    let mut records = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        if timestamps.is_null(row) {
            return Err(Error::InvalidSchema(format!(
                "null value in timestamp column '{}' at row {}",
                schema.timestamp_column, row
            )));
        }
        records.push(SourceRecord {
            id: ids
                .as_ref()
                .map(|array| string_value(array, row))
                .unwrap_or_default(),
            timestamp: timestamps.value(row),
            values: decoders.iter().map(|d| d.value(row)).collect(),
            labels: has_labels.then(|| {
                labels
                    .iter()
                    .map(|(label, array)| (label.to_string(), string_value(array, row)))
                    .collect()
            }),
        });
    }
    Ok(records)
}

fn batch_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::InvalidSchema(format!("Missing column '{}'", name)))
}

fn int_array(array: &ArrayRef, name: &str) -> Result<Int64Array> {
    let cast = arrow::compute::cast(array.as_ref(), &DataType::Int64)?;
    cast.as_primitive_opt::<Int64Type>()
        .cloned()
        .ok_or_else(|| Error::InvalidSchema(format!("Column '{}' is not integer", name)))
}

fn float_array(array: &ArrayRef, name: &str) -> Result<Float64Array> {
    let cast = arrow::compute::cast(array.as_ref(), &DataType::Float64)?;
    cast.as_primitive_opt::<Float64Type>()
        .cloned()
        .ok_or_else(|| Error::InvalidSchema(format!("Column '{}' is not numeric", name)))
}

fn string_array(array: &ArrayRef, name: &str) -> Result<StringArray> {
    let cast = arrow::compute::cast(array.as_ref(), &DataType::Utf8)?;
    cast.as_string_opt::<i32>()
        .cloned()
        .ok_or_else(|| Error::InvalidSchema(format!("Column '{}' is not a string", name)))
}

fn string_value(array: &StringArray, row: usize) -> String {
    if array.is_null(row) {
        String::new()
    } else {
        array.value(row).to_string()
    }
}

/// Typed accessor for one schema field's column
enum ColumnDecoder {
    Int(Int64Array),
    Float(Float64Array),
    Composite(StructArray, Vec<ColumnDecoder>),
}

impl ColumnDecoder {
    fn new(array: &ArrayRef, field: &FieldDescriptor) -> Result<Self> {
        let name = field.column_name();
        match &field.kind {
            FieldKind::Int => Ok(ColumnDecoder::Int(int_array(array, name)?)),
            FieldKind::Float => Ok(ColumnDecoder::Float(float_array(array, name)?)),
            FieldKind::Composite { fields } => {
                let parent = array.as_struct_opt().ok_or_else(|| {
                    Error::InvalidSchema(format!("Column '{}' is not a struct", name))
                })?;
                let children = fields
                    .iter()
                    .map(|child| {
                        let column = parent.column_by_name(child.column_name()).ok_or_else(|| {
                            Error::InvalidSchema(format!(
                                "Missing column '{}.{}'",
                                name,
                                child.column_name()
                            ))
                        })?;
                        ColumnDecoder::new(column, child)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(ColumnDecoder::Composite(parent.clone(), children))
            }
        }
    }

    fn value(&self, row: usize) -> FieldValue {
        match self {
            ColumnDecoder::Int(array) if array.is_null(row) => FieldValue::Missing,
            ColumnDecoder::Int(array) => FieldValue::Int(array.value(row)),
            ColumnDecoder::Float(array) if array.is_null(row) => FieldValue::Missing,
            ColumnDecoder::Float(array) => FieldValue::Float(array.value(row)),
            ColumnDecoder::Composite(parent, _) if parent.is_null(row) => FieldValue::Missing,
            ColumnDecoder::Composite(_, children) => {
                FieldValue::Composite(children.iter().map(|c| c.value(row)).collect())
            }
        }
    }
}
