//! Record schema definitions
//!
//! A [`RecordSchema`] describes the columns of an input file: which column
//! holds the timestamp, which columns become additional labels, and the
//! tagged numeric fields that are turned into samples.

use super::tags::{parse_tag, HELP_KEY, METRIC_NAME_KEY, METRIC_TYPE_KEY};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Suffix appended to counter names that lack it
pub const COUNTER_SUFFIX: &str = "_total";

/// Storage shape of a schema field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldKind {
    /// 64-bit signed integer column
    Int,
    /// 64-bit float column
    Float,
    /// Struct column whose children are expanded recursively
    Composite { fields: Vec<FieldDescriptor> },
}

/// Metric types the mapper can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Point-in-time value, copied verbatim
    Gauge,
    /// Monotonic value, name always ends in `_total`
    Counter,
}

impl MetricKind {
    /// Resolve a `metric_type` tag value.
    ///
    /// `-` suppresses the field and yields `None`. Histogram, summary and
    /// unknown types cannot be represented and are rejected.
    pub fn from_tag(field: &str, metric_type: &str) -> Result<Option<Self>> {
        match metric_type {
            "-" => Ok(None),
            "gauge" => Ok(Some(MetricKind::Gauge)),
            "counter" => Ok(Some(MetricKind::Counter)),
            other => Err(Error::UnsupportedMetricType {
                field: field.to_string(),
                metric_type: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }

    /// Apply the naming convention for this kind.
    pub fn resolve_name(&self, name: &str) -> String {
        match self {
            MetricKind::Counter if !name.ends_with(COUNTER_SUFFIX) => {
                format!("{}{}", name, COUNTER_SUFFIX)
            }
            _ => name.to_string(),
        }
    }
}

/// Static metadata for one schema field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name, used as the default metric name
    pub name: String,
    /// Source column when it differs from `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Declarative metric tag; empty for non-metric columns
    #[serde(default)]
    pub tag: String,
}

impl FieldDescriptor {
    /// Integer field
    pub fn int(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: None,
            kind: FieldKind::Int,
            tag: tag.into(),
        }
    }

    /// Float field
    pub fn float(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: None,
            kind: FieldKind::Float,
            tag: tag.into(),
        }
    }

    /// Composite field made of sub-fields
    pub fn composite(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.into(),
            column: None,
            kind: FieldKind::Composite { fields },
            tag: String::new(),
        }
    }

    /// Read values from `column` instead of the field name
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Source column name
    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    /// Resolve the tag into a metric definition.
    ///
    /// Returns `Ok(None)` for fields that produce no sample: untagged
    /// columns, fields without `metric_type`, and `metric_type:-`.
    pub fn metric_spec(&self) -> Result<Option<MetricSpec>> {
        let mut tags = parse_tag(&self.tag);
        let Some(metric_type) = tags.remove(METRIC_TYPE_KEY) else {
            return Ok(None);
        };
        let Some(kind) = MetricKind::from_tag(&self.name, &metric_type)? else {
            return Ok(None);
        };

        let base_name = tags
            .remove(METRIC_NAME_KEY)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.name.clone());
        let help = tags.remove(HELP_KEY);

        Ok(Some(MetricSpec {
            name: kind.resolve_name(&base_name),
            kind,
            help,
            static_labels: tags,
        }))
    }
}

/// A field's resolved metric definition
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    /// Final metric name, counter suffix applied
    pub name: String,
    pub kind: MetricKind,
    pub help: Option<String>,
    /// Remaining tag keys, attached to every sample of this field
    pub static_labels: BTreeMap<String, String>,
}

/// A column whose value becomes a label on every sample of the record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelColumn {
    pub column: String,
    pub label: String,
}

/// Schema for one kind of input record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSchema {
    /// Column holding the record timestamp, in seconds
    pub timestamp_column: String,
    /// Column holding the record identifier
    #[serde(default)]
    pub id_column: Option<String>,
    /// Columns exposed as additional labels
    #[serde(default)]
    pub label_columns: Vec<LabelColumn>,
    /// Tagged numeric fields
    pub fields: Vec<FieldDescriptor>,
}

impl RecordSchema {
    /// Create a new schema builder
    pub fn builder(timestamp_column: impl Into<String>) -> RecordSchemaBuilder {
        RecordSchemaBuilder::new(timestamp_column)
    }

    /// Load a schema from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let schema: RecordSchema = serde_json::from_str(json)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Load a schema from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Whether records of this schema carry additional labels
    pub fn has_additional_labels(&self) -> bool {
        !self.label_columns.is_empty()
    }

    /// Check structural constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.timestamp_column.is_empty() {
            return Err(Error::InvalidSchema(
                "timestamp column name cannot be empty".into(),
            ));
        }
        if self.fields.is_empty() {
            return Err(Error::InvalidSchema("schema has no fields".into()));
        }
        validate_fields(&self.fields)?;
        for label in &self.label_columns {
            if label.label.is_empty() || label.column.is_empty() {
                return Err(Error::InvalidSchema(format!(
                    "label column mapping '{}' -> '{}' has an empty side",
                    label.column, label.label
                )));
            }
        }
        Ok(())
    }

    /// Container resource-usage snapshots (id, timestamp, cpu, mem, net, disk)
    pub fn container_usage() -> Self {
        Self::builder("timestamp")
            .id_column("id")
            .with_label("id", "ID")
            .with_label("aid", "AppGroupID")
            .with_field(FieldDescriptor::float("cpu", "metric_type:gauge"))
            .with_field(FieldDescriptor::int("mem", "metric_type:gauge"))
            .with_field(FieldDescriptor::float("net_in", "metric_type:gauge"))
            .with_field(FieldDescriptor::float("net_out", "metric_type:gauge"))
            .with_field(FieldDescriptor::float("disk", "metric_type:gauge"))
            .with_field(FieldDescriptor::int("aid", ""))
            .build()
    }
}

fn validate_fields(fields: &[FieldDescriptor]) -> Result<()> {
    for field in fields {
        if field.name.is_empty() {
            return Err(Error::InvalidSchema("field name cannot be empty".into()));
        }
        if let FieldKind::Composite { fields } = &field.kind {
            if fields.is_empty() {
                return Err(Error::InvalidSchema(format!(
                    "composite field '{}' has no sub-fields",
                    field.name
                )));
            }
            validate_fields(fields)?;
        }
    }
    Ok(())
}

/// Builder for RecordSchema
#[derive(Debug)]
pub struct RecordSchemaBuilder {
    timestamp_column: String,
    id_column: Option<String>,
    label_columns: Vec<LabelColumn>,
    fields: Vec<FieldDescriptor>,
}

impl RecordSchemaBuilder {
    pub fn new(timestamp_column: impl Into<String>) -> Self {
        Self {
            timestamp_column: timestamp_column.into(),
            id_column: None,
            label_columns: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = Some(column.into());
        self
    }

    /// Expose `column` as label `label` on every sample
    pub fn with_label(mut self, column: impl Into<String>, label: impl Into<String>) -> Self {
        self.label_columns.push(LabelColumn {
            column: column.into(),
            label: label.into(),
        });
        self
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn build(self) -> RecordSchema {
        RecordSchema {
            timestamp_column: self.timestamp_column,
            id_column: self.id_column,
            label_columns: self.label_columns,
            fields: self.fields,
        }
    }
}
