//! Backfill telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use std::time::Duration;

struct BackfillInstruments {
    samples_appended: Counter<u64>,
    samples_dropped: Counter<u64>,
    rows_dropped: Counter<u64>,
    blocks_flushed: Counter<u64>,
    block_samples: Histogram<u64>,
    rollovers: Counter<u64>,
    drain_rows: Histogram<u64>,
    drain_duration_seconds: Histogram<f64>,
}

fn instruments() -> &'static BackfillInstruments {
    static INSTRUMENTS: OnceLock<BackfillInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("tsdb_backfill");
        BackfillInstruments {
            samples_appended: meter
                .u64_counter("tsdb_backfill.samples.appended")
                .with_description("Samples accepted by block writers")
                .init(),
            samples_dropped: meter
                .u64_counter("tsdb_backfill.samples.dropped")
                .with_description("Samples lost to block writer failures")
                .init(),
            rows_dropped: meter
                .u64_counter("tsdb_backfill.rows.dropped")
                .with_description("Input rows abandoned after decode failures")
                .init(),
            blocks_flushed: meter
                .u64_counter("tsdb_backfill.blocks.flushed")
                .with_description("Blocks persisted to storage")
                .init(),
            block_samples: meter
                .u64_histogram("tsdb_backfill.blocks.samples")
                .with_description("Samples per flushed block")
                .init(),
            rollovers: meter
                .u64_counter("tsdb_backfill.blocks.rollovers")
                .with_description("Block rollovers by reason")
                .init(),
            drain_rows: meter
                .u64_histogram("tsdb_backfill.drain.rows")
                .with_description("Rows handed to the block writer per drain")
                .init(),
            drain_duration_seconds: meter
                .f64_histogram("tsdb_backfill.drain.duration")
                .with_description("Time spent appending one drained buffer")
                .with_unit("s")
                .init(),
        }
    })
}

pub fn record_sample_appended() {
    instruments().samples_appended.add(1, &[]);
}

pub fn record_samples_dropped(samples: u64) {
    instruments().samples_dropped.add(samples, &[]);
}

pub fn record_rows_dropped(rows: u64) {
    instruments().rows_dropped.add(rows, &[]);
}

pub fn record_block_flushed(samples: u64) {
    let i = instruments();
    i.blocks_flushed.add(1, &[]);
    i.block_samples.record(samples, &[]);
}

pub fn record_rollover(reason: &'static str) {
    instruments()
        .rollovers
        .add(1, &[KeyValue::new("reason", reason)]);
}

pub fn record_drain(duration: Duration, rows: u64) {
    let i = instruments();
    i.drain_rows.record(rows, &[]);
    i.drain_duration_seconds.record(duration.as_secs_f64(), &[]);
}
