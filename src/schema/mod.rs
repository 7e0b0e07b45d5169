//! Input record schemas
//!
//! Field metadata is declared once per record type and shared read-only by
//! every mapping worker. Each numeric field carries a declarative tag that
//! says whether and how it becomes a metric.

mod fields;
pub mod tags;

pub use fields::{
    FieldDescriptor,
    FieldKind,
    LabelColumn,
    MetricKind,
    MetricSpec,
    RecordSchema,
    RecordSchemaBuilder,
    COUNTER_SUFFIX,
};
pub use tags::parse_tag;
