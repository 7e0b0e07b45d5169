//! Schema-driven record to sample mapping
//!
//! The mapper resolves every field's tag once, when it is built, into a
//! plan mirroring the schema's field tree. Mapping a record walks that plan
//! alongside the record's values and emits one sample per metric field.

mod labels;

pub use labels::{Label, Labels, METRIC_NAME_LABEL};

use crate::schema::{FieldDescriptor, FieldKind, MetricKind, MetricSpec, RecordSchema};
use crate::source::{FieldValue, SourceRecord};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A fully resolved time-series point
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub help: Option<String>,
    pub value: f64,
    pub timestamp_ms: i64,
    /// Static tag labels, record labels and `__name__`
    pub labels: Labels,
}

/// All samples derived from one record; they share one timestamp
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleRow {
    samples: Vec<MetricSample>,
}

impl SampleRow {
    pub fn new(samples: Vec<MetricSample>) -> Self {
        Self { samples }
    }

    /// Timestamp of the first sample, the row's ordering key
    pub fn timestamp(&self) -> Option<i64> {
        self.samples.first().map(|s| s.timestamp_ms)
    }

    pub fn samples(&self) -> &[MetricSample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<MetricSample> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Per-field mapping plan
#[derive(Debug)]
enum FieldPlan {
    Skip,
    Metric(MetricSpec),
    Composite(String, Vec<FieldPlan>),
}

impl FieldPlan {
    fn build(field: &FieldDescriptor) -> Result<Self> {
        match &field.kind {
            FieldKind::Composite { fields } => Ok(FieldPlan::Composite(
                field.name.clone(),
                fields.iter().map(FieldPlan::build).collect::<Result<_>>()?,
            )),
            FieldKind::Int | FieldKind::Float => Ok(match field.metric_spec()? {
                Some(spec) => FieldPlan::Metric(spec),
                None => FieldPlan::Skip,
            }),
        }
    }

    fn metric_count(&self) -> usize {
        match self {
            FieldPlan::Skip => 0,
            FieldPlan::Metric(_) => 1,
            FieldPlan::Composite(_, children) => children.iter().map(FieldPlan::metric_count).sum(),
        }
    }
}

/// Converts source records into sample rows
#[derive(Debug, Clone)]
pub struct MetricMapper {
    plan: Arc<[FieldPlan]>,
}

impl MetricMapper {
    /// Build a mapper for `schema`.
    ///
    /// Fails when a field is tagged with a metric type that cannot be
    /// represented (histogram, summary, unknown).
    pub fn new(schema: &RecordSchema) -> Result<Self> {
        schema.validate()?;
        let plan = schema
            .fields
            .iter()
            .map(FieldPlan::build)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { plan: plan.into() })
    }

    /// Number of samples a fully populated record produces
    pub fn metric_count(&self) -> usize {
        self.plan.iter().map(FieldPlan::metric_count).sum()
    }

    /// Map one record. Null values produce no sample.
    pub fn map_record(&self, record: &SourceRecord) -> Result<SampleRow> {
        let timestamp_ms = record.timestamp.saturating_mul(1000);
        let mut samples = Vec::with_capacity(self.metric_count());
        map_fields(
            &self.plan,
            &record.values,
            timestamp_ms,
            record.labels.as_ref(),
            &mut samples,
        )?;
        Ok(SampleRow::new(samples))
    }

    /// Map a batch, one row per record
    pub fn map_batch(&self, batch: &[SourceRecord]) -> Result<Vec<SampleRow>> {
        batch.iter().map(|record| self.map_record(record)).collect()
    }
}

fn map_fields(
    plan: &[FieldPlan],
    values: &[FieldValue],
    timestamp_ms: i64,
    record_labels: Option<&BTreeMap<String, String>>,
    out: &mut Vec<MetricSample>,
) -> Result<()> {
    if plan.len() != values.len() {
        return Err(Error::InvalidSchema(format!(
            "record has {} values, schema has {} fields",
            values.len(),
            plan.len()
        )));
    }

    for (field, value) in plan.iter().zip(values) {
        match (field, value) {
            (FieldPlan::Skip, _) | (_, FieldValue::Missing) => {}
            (FieldPlan::Metric(spec), FieldValue::Int(v)) => {
                out.push(make_sample(spec, *v as f64, timestamp_ms, record_labels));
            }
            (FieldPlan::Metric(spec), FieldValue::Float(v)) => {
                out.push(make_sample(spec, *v, timestamp_ms, record_labels));
            }
            (FieldPlan::Composite(_, children), FieldValue::Composite(child_values)) => {
                map_fields(children, child_values, timestamp_ms, record_labels, out)?;
            }
            (FieldPlan::Metric(spec), FieldValue::Composite(_)) => {
                return Err(Error::InvalidSchema(format!(
                    "metric '{}' received a composite value",
                    spec.name
                )));
            }
            (FieldPlan::Composite(name, _), _) => {
                return Err(Error::InvalidSchema(format!(
                    "composite field '{}' received a scalar value",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn make_sample(
    spec: &MetricSpec,
    value: f64,
    timestamp_ms: i64,
    record_labels: Option<&BTreeMap<String, String>>,
) -> MetricSample {
    let mut labels = spec.static_labels.clone();
    if let Some(extra) = record_labels {
        // record labels win over static tag labels
        labels.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    labels.insert(METRIC_NAME_LABEL.to_string(), spec.name.clone());

    MetricSample {
        name: spec.name.clone(),
        kind: spec.kind,
        help: spec.help.clone(),
        value,
        timestamp_ms,
        labels: labels.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;

    fn record(values: Vec<FieldValue>, labels: Option<Vec<(&str, &str)>>) -> SourceRecord {
        SourceRecord {
            id: "c_1".into(),
            timestamp: 1_583_020_800,
            values,
            labels: labels.map(|pairs| {
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            }),
        }
    }

    fn mapper(fields: Vec<FieldDescriptor>) -> MetricMapper {
        let schema = fields
            .into_iter()
            .fold(RecordSchema::builder("timestamp"), |b, f| b.with_field(f))
            .build();
        MetricMapper::new(&schema).unwrap()
    }

    #[test]
    fn test_gauge_copied_verbatim() {
        let m = mapper(vec![FieldDescriptor::float("cpu", "metric_type:gauge,unit:W")]);
        let row = m.map_record(&record(vec![FieldValue::Float(42.5)], None)).unwrap();

        assert_eq!(row.len(), 1);
        let sample = &row.samples()[0];
        assert_eq!(sample.name, "cpu");
        assert_eq!(sample.kind, MetricKind::Gauge);
        assert_eq!(sample.value, 42.5);
        assert_eq!(sample.timestamp_ms, 1_583_020_800_000);
        assert_eq!(sample.labels.get("unit"), Some("W"));
        assert_eq!(sample.labels.metric_name(), Some("cpu"));
        assert_eq!(sample.labels.get("metric_type"), None);
        assert_eq!(sample.help, None);
    }

    #[test]
    fn test_counter_name_suffix() {
        let m = mapper(vec![
            FieldDescriptor::int("requests", "metric_type:counter"),
            FieldDescriptor::int("errors_total", "metric_type:counter"),
        ]);
        let row = m
            .map_record(&record(vec![FieldValue::Int(3), FieldValue::Int(1)], None))
            .unwrap();
        let names: Vec<&str> = row.samples().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["requests_total", "errors_total"]);
        assert_eq!(row.samples()[0].value, 3.0);
    }

    #[test]
    fn test_untagged_and_suppressed_fields_skipped() {
        let m = mapper(vec![
            FieldDescriptor::int("aid", ""),
            FieldDescriptor::int("mem", "metric_type:-,unit:B"),
            FieldDescriptor::float("cpu", "metric_type:gauge"),
        ]);
        assert_eq!(m.metric_count(), 1);
        let row = m
            .map_record(&record(
                vec![FieldValue::Int(1), FieldValue::Int(2), FieldValue::Float(3.0)],
                None,
            ))
            .unwrap();
        assert_eq!(row.len(), 1);
        assert_eq!(row.samples()[0].name, "cpu");
    }

    #[test]
    fn test_record_labels_override_static_labels() {
        let m = mapper(vec![FieldDescriptor::float(
            "cpu",
            "metric_type:gauge,zone:static,unit:W",
        )]);
        let row = m
            .map_record(&record(
                vec![FieldValue::Float(1.0)],
                Some(vec![("zone", "from-record"), ("ID", "c_1")]),
            ))
            .unwrap();
        let labels = &row.samples()[0].labels;
        assert_eq!(labels.get("zone"), Some("from-record"));
        assert_eq!(labels.get("ID"), Some("c_1"));
        assert_eq!(labels.get("unit"), Some("W"));
    }

    #[test]
    fn test_name_label_cannot_be_overridden_by_record() {
        let m = mapper(vec![FieldDescriptor::float("cpu", "metric_type:gauge")]);
        let row = m
            .map_record(&record(vec![FieldValue::Float(1.0)], Some(vec![("__name__", "x")])))
            .unwrap();
        assert_eq!(row.samples()[0].labels.metric_name(), Some("cpu"));
    }

    #[test]
    fn test_help_and_name_override() {
        let m = mapper(vec![FieldDescriptor::float(
            "net_in",
            "metric_type:gauge,metric_name:network_in_bytes,help:inbound traffic",
        )]);
        let row = m.map_record(&record(vec![FieldValue::Float(1.0)], None)).unwrap();
        let sample = &row.samples()[0];
        assert_eq!(sample.name, "network_in_bytes");
        assert_eq!(sample.help.as_deref(), Some("inbound traffic"));
        assert_eq!(sample.labels.get("help"), None);
        assert_eq!(sample.labels.get("metric_name"), None);
    }

    #[test]
    fn test_histogram_fails_fast() {
        let schema = RecordSchema::builder("timestamp")
            .with_field(FieldDescriptor::float("latency", "metric_type:histogram"))
            .build();
        assert!(matches!(
            MetricMapper::new(&schema),
            Err(Error::UnsupportedMetricType { .. })
        ));
    }

    #[test]
    fn test_composite_fields_expanded() {
        let m = mapper(vec![FieldDescriptor::composite(
            "net",
            vec![
                FieldDescriptor::int("rx", "metric_type:counter"),
                FieldDescriptor::composite(
                    "errors",
                    vec![FieldDescriptor::int("dropped", "metric_type:gauge")],
                ),
            ],
        )]);
        let row = m
            .map_record(&record(
                vec![FieldValue::Composite(vec![
                    FieldValue::Int(10),
                    FieldValue::Composite(vec![FieldValue::Int(2)]),
                ])],
                Some(vec![("ID", "c_9")]),
            ))
            .unwrap();
        assert_eq!(row.len(), 2);
        assert!(row.samples().iter().all(|s| s.timestamp_ms == 1_583_020_800_000));
        assert!(row.samples().iter().all(|s| s.labels.get("ID") == Some("c_9")));
        assert_eq!(row.samples()[1].name, "dropped");
    }

    #[test]
    fn test_missing_values_produce_no_sample() {
        let m = mapper(vec![FieldDescriptor::float("cpu", "metric_type:gauge")]);
        let row = m.map_record(&record(vec![FieldValue::Missing], None)).unwrap();
        assert!(row.is_empty());
        assert_eq!(row.timestamp(), None);
    }

    #[test]
    fn test_value_shape_mismatch() {
        let m = mapper(vec![FieldDescriptor::float("cpu", "metric_type:gauge")]);
        assert!(m.map_record(&record(vec![], None)).is_err());
        assert!(m
            .map_record(&record(vec![FieldValue::Composite(vec![])], None))
            .is_err());
    }
}
