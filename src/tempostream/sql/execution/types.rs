//! Core value and record types for the aggregation engine.
//!
//! - [`FieldValue`] - the value type system flowing through events, buckets
//!   and persisted rows
//! - [`StreamRecord`] - the record format for stream events and completed
//!   bucket records cascading between executors
//! - [`system_columns`] - the reserved column names of the aggregate schema

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Reserved column names used by the aggregation schema and the compiled
/// retrieval conditions.
pub mod system_columns {
    /// Bucket start timestamp (processing time), present in every table row
    pub const AGG_TIMESTAMP: &str = "AGG_TIMESTAMP";
    /// Bucket start timestamp on the external time axis (external-time mode)
    pub const AGG_EVENT_TIMESTAMP: &str = "AGG_EVENT_TIMESTAMP";
    /// Latest contributing event time within the bucket (external-time mode)
    pub const AGG_LAST_EVENT_TIMESTAMP: &str = "AGG_LAST_EVENT_TIMESTAMP";
    /// Synthetic attribute carrying the `within` range start at lookup time
    pub const WITHIN_START: &str = "_START";
    /// Synthetic attribute carrying the `within` range end at lookup time
    pub const WITHIN_END: &str = "_END";
    /// Prefix of the per-pair boundary cutoff attributes used in
    /// distributed-mode reconciliation
    pub const AGG_TIMESTAMP_FILTER_PREFIX: &str = "_AGG_TIMESTAMP_FILTER_";

    /// Name of the i-th distributed boundary cutoff attribute
    pub fn timestamp_filter(index: usize) -> String {
        format!("{}{}", AGG_TIMESTAMP_FILTER_PREFIX, index)
    }
}

/// Static type of a field, used for shape checking at query-compile time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Integer,
    Float,
    String,
    Boolean,
    Timestamp,
    Null,
}

impl FieldType {
    /// Canonical type name for error reporting
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::String => "STRING",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Null => "NULL",
        }
    }

    /// Whether values of this type can participate in numeric comparisons.
    /// Timestamps compare as epoch milliseconds.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Integer | FieldType::Float | FieldType::Timestamp
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A value in a record field.
///
/// Supports the types the aggregate functions operate over. Timestamps are
/// calendar values; the engine's own bucket timestamps are plain epoch
/// milliseconds stored as `Integer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Boolean value
    Boolean(bool),
    /// NULL value
    Null,
    /// Calendar timestamp
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    /// Static type of this value
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::Null => FieldType::Null,
            FieldValue::Timestamp(_) => FieldType::Timestamp,
        }
    }

    /// Type name for error reporting
    pub fn type_name(&self) -> &'static str {
        self.field_type().name()
    }

    /// Numeric view of this value, if it has one. Timestamps convert to
    /// epoch milliseconds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::Timestamp(ts) => Some(ts.and_utc().timestamp_millis() as f64),
            _ => None,
        }
    }

    /// Epoch-milliseconds view of this value, if it has one
    pub fn as_millis(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            FieldValue::Float(f) => Some(*f as i64),
            FieldValue::Timestamp(ts) => Some(ts.and_utc().timestamp_millis()),
            _ => None,
        }
    }

    /// Compare two values for filtering and MIN/MAX accumulation.
    ///
    /// Numeric types (including timestamps, as epoch millis) compare with
    /// each other; strings and booleans compare within their own type.
    /// Comparisons involving NULL or mixed incomparable types yield `None`.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Null, _) | (_, FieldValue::Null) => None,
            (FieldValue::String(a), FieldValue::String(b)) => Some(a.cmp(b)),
            (FieldValue::Boolean(a), FieldValue::Boolean(b)) => Some(a.cmp(b)),
            (a, b) => {
                let (x, y) = (a.as_f64()?, b.as_f64()?);
                x.partial_cmp(&y)
            }
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::String(s) => write!(f, "{}", s),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Null => write!(f, "NULL"),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts),
        }
    }
}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            FieldValue::Integer(i) => i.hash(state),
            // Bit representation keeps NaN and -0.0 hashable
            FieldValue::Float(f) => f.to_bits().hash(state),
            FieldValue::String(s) => s.hash(state),
            FieldValue::Boolean(b) => b.hash(state),
            FieldValue::Null => {}
            FieldValue::Timestamp(ts) => ts.and_utc().timestamp_millis().hash(state),
        }
    }
}

/// A record flowing through the engine: a raw stream event at the base
/// granularity, or a completed bucket cascading to the next-coarser
/// executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Field name to value mapping
    pub fields: HashMap<String, FieldValue>,
    /// Arrival timestamp in epoch milliseconds
    pub timestamp: i64,
}

impl StreamRecord {
    /// Create a record from a field map and arrival timestamp
    pub fn new(timestamp: i64, fields: HashMap<String, FieldValue>) -> Self {
        StreamRecord { fields, timestamp }
    }

    /// Look up a field value by name
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}
