//! End-to-end backfill from Parquet input files to Parquet blocks on disk

use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tsdb_backfill::config::{BackfillConfig, ComponentFactory};
use tsdb_backfill::ingester::Backfill;
use tsdb_backfill::schema::RecordSchema;
use tsdb_backfill::source::{discover_files, ParquetSource};
use tsdb_backfill::storage::{BlockMeta, BLOCK_DATA_FILE, BLOCK_META_FILE};

/// Container usage rows for `ids`, one row per id per timestamp
fn usage_batch(ids: &[&str], timestamps: &[i64]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("timestamp", DataType::Int64, false),
        Field::new("cpu", DataType::Float64, true),
        Field::new("mem", DataType::Int64, true),
        Field::new("net_in", DataType::Float64, true),
        Field::new("net_out", DataType::Float64, true),
        Field::new("disk", DataType::Float64, true),
        Field::new("aid", DataType::Int64, true),
    ]));

    let mut id_col = Vec::new();
    let mut ts_col = Vec::new();
    for ts in timestamps {
        for id in ids {
            id_col.push(*id);
            ts_col.push(*ts);
        }
    }
    let n = id_col.len();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(id_col)),
            Arc::new(Int64Array::from(ts_col)),
            Arc::new(Float64Array::from(vec![Some(0.5); n])),
            Arc::new(Int64Array::from(vec![Some(4096); n])),
            Arc::new(Float64Array::from(vec![Some(1.0); n])),
            Arc::new(Float64Array::from(vec![Some(2.0); n])),
            Arc::new(Float64Array::from(vec![None::<f64>; n])),
            Arc::new(Int64Array::from(vec![Some(3); n])),
        ],
    )
    .unwrap()
}

fn write_input(path: &Path, batch: &RecordBatch, rows_per_group: usize) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let props = WriterProperties::builder()
        .set_max_row_group_size(rows_per_group)
        .build();
    let file = File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).unwrap();
    writer.write(batch).unwrap();
    writer.close().unwrap();
}

fn block_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.join(BLOCK_META_FILE).is_file())
        .collect();
    dirs.sort();
    dirs
}

#[tokio::test]
async fn test_parquet_input_to_block_directory() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();

    // 2 ids x 6 timestamps = 12 rows in groups of 5
    write_input(
        &input.path().join("day=1/part-0.parquet"),
        &usage_batch(&["c_1", "c_2"], &[0, 60, 120, 180, 240, 300]),
        5,
    );
    // 1 id x 3 timestamps = 3 rows
    write_input(
        &input.path().join("part-1.parquet"),
        &usage_batch(&["c_3"], &[30, 90, 150]),
        2,
    );
    std::fs::write(input.path().join("notes.txt"), b"ignored").unwrap();

    let config = BackfillConfig {
        input_path: input.path().to_path_buf(),
        output_path: output.path().to_path_buf(),
        // one drain, so the block window starts at the earliest sample
        drain_threshold: 1_000,
        status_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let schema = Arc::new(RecordSchema::container_usage());
    let files = discover_files(&config.input_path).unwrap();
    assert_eq!(files.len(), 2);

    let store = ComponentFactory::create_block_store_for("local", &config).unwrap();
    let source = Arc::new(ParquetSource::new(Arc::clone(&schema)));
    let job = Backfill::new(config, &schema, source, store).unwrap();
    let summary = job.run(&files).await.unwrap();

    assert_eq!(summary.rows_total, 15);
    assert_eq!(summary.rows_done, 15);
    // cpu, mem, net_in, net_out per row; disk is null, aid is untagged
    assert_eq!(summary.samples_appended, 60);

    let dirs = block_dirs(output.path());
    assert_eq!(dirs.len(), summary.blocks.len());
    assert_eq!(dirs.len(), 1);

    let meta: BlockMeta =
        serde_json::from_slice(&std::fs::read(dirs[0].join(BLOCK_META_FILE)).unwrap()).unwrap();
    assert_eq!(meta.num_samples, 60);
    // 4 metrics x 3 ids
    assert_eq!(meta.num_series, 12);
    assert_eq!(meta.min_time, 1_583_020_800_000);
    assert_eq!(meta.max_time, 1_583_020_800_000 + 300_000 + 1);
    assert_eq!(dirs[0].file_name().unwrap(), meta.block_id.to_string().as_str());

    let file = File::open(dirs[0].join(BLOCK_DATA_FILE)).unwrap();
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap();
    let mut rows = 0;
    for batch in reader {
        let batch = batch.unwrap();
        let schema = batch.schema();
        assert!(schema.field_with_name("ID").is_ok());
        assert!(schema.field_with_name("AppGroupID").is_ok());
        assert!(schema.field_with_name("metric_name").is_ok());
        rows += batch.num_rows();
    }
    assert_eq!(rows, 60);
}

#[tokio::test]
async fn test_block_duration_splits_output() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_input(
        &input.path().join("part-0.parquet"),
        &usage_batch(&["c_1"], &[0, 3_600, 7_200, 10_800]),
        10,
    );

    let config = BackfillConfig {
        input_path: input.path().to_path_buf(),
        output_path: output.path().to_path_buf(),
        block_duration: Duration::from_secs(2 * 3_600),
        status_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let schema = Arc::new(RecordSchema::container_usage());
    let files = discover_files(&config.input_path).unwrap();

    let store = ComponentFactory::create_block_store_for("local", &config).unwrap();
    let source = Arc::new(ParquetSource::new(Arc::clone(&schema)));
    let job = Backfill::new(config, &schema, source, store).unwrap();
    let summary = job.run(&files).await.unwrap();

    // [0h, 2h) and [2h, 4h)
    assert_eq!(summary.blocks.len(), 2);
    assert_eq!(block_dirs(output.path()).len(), 2);
    for meta in &summary.blocks {
        assert!(meta.max_time - meta.min_time <= 2 * 3_600_000);
        assert_eq!(meta.num_samples, 8);
    }
}
