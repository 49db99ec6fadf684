//! The durable table seam of the aggregation engine.
//!
//! One [`AggregateTable`] exists per maintained granularity and holds the
//! closed buckets of that level, keyed by bucket start timestamp plus group
//! key. The engine consumes tables through this narrow trait only: condition
//! compilation, filtered scans, inserts of closed buckets, and predicate
//! deletes for retention purging. Storage internals (indexing, I/O, on-disk
//! format) belong to the implementation behind the trait.
//!
//! [`InMemoryAggregateTable`] is the reference implementation the tests and
//! embedded deployments run against.

pub mod error;
pub mod memory;

pub use error::TableError;
pub use memory::InMemoryAggregateTable;

use crate::tempostream::sql::ast::Expr;
use crate::tempostream::sql::error::SqlError;
use crate::tempostream::sql::execution::expression::{
    parse_expression, EventShape, ExecutableExpression,
};
use crate::tempostream::sql::execution::types::{FieldType, FieldValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordered attribute listing of an aggregate table. Mirrors the
/// aggregation's base column list plus the internal timestamp columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    attributes: Vec<(String, FieldType)>,
}

impl TableSchema {
    pub fn new(attributes: Vec<(String, FieldType)>) -> Self {
        TableSchema { attributes }
    }

    /// Attributes in declaration order
    pub fn attributes(&self) -> &[(String, FieldType)] {
        &self.attributes
    }

    /// Attribute names in declaration order
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|(n, _)| n.as_str())
    }

    /// Whether the schema defines this attribute
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.iter().any(|(n, _)| n == name)
    }

    /// Event shape over this schema, for expression compilation
    pub fn to_event_shape(&self) -> EventShape {
        let mut shape = EventShape::new();
        for (name, field_type) in &self.attributes {
            shape.set_attribute(name.clone(), *field_type);
        }
        shape
    }
}

/// One persisted closed bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    /// Group-by key the bucket belongs to
    pub group_key: String,
    /// Bucket start timestamp (epoch millis)
    pub window_start: i64,
    /// Column values: group fields, base aggregate columns, timestamp columns
    pub values: HashMap<String, FieldValue>,
}

/// A table filter compiled once at query-compile time and evaluated per
/// lookup against each row merged with the lookup's synthetic attributes
/// (`_START`, `_END`, boundary cutoffs).
#[derive(Debug, Clone)]
pub struct CompiledTableCondition {
    condition: ExecutableExpression,
}

impl CompiledTableCondition {
    /// Whether a row matches under the given lookup parameters
    pub fn matches(
        &self,
        row: &TableRow,
        parameters: &HashMap<String, FieldValue>,
    ) -> Result<bool, SqlError> {
        let mut combined = row.values.clone();
        for (name, value) in parameters {
            combined.insert(name.clone(), value.clone());
        }
        self.condition.evaluate_bool(&combined)
    }
}

/// Compile a filter predicate against a table schema extended with the
/// lookup-time synthetic attributes. Shared by every table implementation;
/// kept out of the trait so implementations only provide storage.
pub fn compile_table_condition(
    predicate: &Expr,
    schema: &TableSchema,
    lookup_shape: &EventShape,
) -> Result<CompiledTableCondition, SqlError> {
    let mut shape = schema.to_event_shape();
    shape.extend(lookup_shape);
    let condition = parse_expression(predicate, &shape)?;
    Ok(CompiledTableCondition { condition })
}

/// Durable store for one granularity's closed buckets.
pub trait AggregateTable: Send + Sync {
    /// Table name, used in diagnostics
    fn name(&self) -> &str;

    /// Schema of the persisted rows
    fn table_definition(&self) -> &TableSchema;

    /// Compile a filter predicate for later [`find`](Self::find) calls
    fn compile_condition(
        &self,
        predicate: &Expr,
        lookup_shape: &EventShape,
    ) -> Result<CompiledTableCondition, SqlError> {
        compile_table_condition(predicate, self.table_definition(), lookup_shape)
    }

    /// Scan for rows matching a compiled condition under the given lookup
    /// parameters
    fn find(
        &self,
        condition: &CompiledTableCondition,
        parameters: &HashMap<String, FieldValue>,
    ) -> Result<Vec<TableRow>, TableError>;

    /// Insert a closed bucket, replacing any previous row for the same
    /// (window start, group key)
    fn insert(&self, row: TableRow) -> Result<(), TableError>;

    /// Delete every row the predicate selects, returning how many went
    fn delete_where(&self, predicate: &dyn Fn(&TableRow) -> bool) -> Result<usize, TableError>;

    /// Number of persisted rows
    fn row_count(&self) -> usize;
}
