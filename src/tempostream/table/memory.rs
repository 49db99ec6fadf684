//! In-memory reference implementation of [`AggregateTable`].
//!
//! Rows live in an `RwLock`-guarded map keyed by (window start, group key),
//! matching the bucket identity the executors use, so a re-closed bucket
//! (recovery followed by further events) replaces its earlier row instead of
//! duplicating it.

use super::{AggregateTable, CompiledTableCondition, TableError, TableRow, TableSchema};
use crate::tempostream::sql::execution::types::FieldValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// RwLock'd row store for one granularity
pub struct InMemoryAggregateTable {
    name: String,
    schema: TableSchema,
    // BTreeMap keeps scans in (window_start, group_key) order, which keeps
    // retrieval results deterministic without a sort on every find.
    rows: RwLock<BTreeMap<(i64, String), TableRow>>,
}

impl InMemoryAggregateTable {
    pub fn new(name: impl Into<String>, schema: TableSchema) -> Self {
        InMemoryAggregateTable {
            name: name.into(),
            schema,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Snapshot of all rows in (window start, group key) order
    pub fn snapshot(&self) -> Result<Vec<TableRow>, TableError> {
        let rows = self.rows.read().map_err(|_| TableError::LockPoisoned {
            table_name: self.name.clone(),
            operation: "snapshot",
        })?;
        Ok(rows.values().cloned().collect())
    }
}

impl AggregateTable for InMemoryAggregateTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn table_definition(&self) -> &TableSchema {
        &self.schema
    }

    fn find(
        &self,
        condition: &CompiledTableCondition,
        parameters: &HashMap<String, FieldValue>,
    ) -> Result<Vec<TableRow>, TableError> {
        let rows = self.rows.read().map_err(|_| TableError::LockPoisoned {
            table_name: self.name.clone(),
            operation: "find",
        })?;
        let mut matches = Vec::new();
        for row in rows.values() {
            let selected =
                condition
                    .matches(row, parameters)
                    .map_err(|e| TableError::StorageFailure {
                        table_name: self.name.clone(),
                        message: e.to_string(),
                    })?;
            if selected {
                matches.push(row.clone());
            }
        }
        Ok(matches)
    }

    fn insert(&self, row: TableRow) -> Result<(), TableError> {
        for column in row.values.keys() {
            if !self.schema.contains(column) {
                return Err(TableError::SchemaMismatch {
                    table_name: self.name.clone(),
                    message: format!("unknown column '{}'", column),
                });
            }
        }
        let mut rows = self.rows.write().map_err(|_| TableError::LockPoisoned {
            table_name: self.name.clone(),
            operation: "insert",
        })?;
        rows.insert((row.window_start, row.group_key.clone()), row);
        Ok(())
    }

    fn delete_where(&self, predicate: &dyn Fn(&TableRow) -> bool) -> Result<usize, TableError> {
        let mut rows = self.rows.write().map_err(|_| TableError::LockPoisoned {
            table_name: self.name.clone(),
            operation: "delete_where",
        })?;
        let before = rows.len();
        rows.retain(|_, row| !predicate(row));
        Ok(before - rows.len())
    }

    fn row_count(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tempostream::sql::ast::{BinaryOperator, Expr};
    use crate::tempostream::sql::execution::expression::EventShape;
    use crate::tempostream::sql::execution::types::{system_columns, FieldType};

    fn table() -> InMemoryAggregateTable {
        let schema = TableSchema::new(vec![
            (system_columns::AGG_TIMESTAMP.to_string(), FieldType::Integer),
            ("symbol".to_string(), FieldType::String),
            ("trades".to_string(), FieldType::Integer),
        ]);
        InMemoryAggregateTable::new("agg_SECONDS", schema)
    }

    fn row(window_start: i64, symbol: &str, trades: i64) -> TableRow {
        let mut values = HashMap::new();
        values.insert(
            system_columns::AGG_TIMESTAMP.to_string(),
            FieldValue::Integer(window_start),
        );
        values.insert("symbol".to_string(), FieldValue::String(symbol.into()));
        values.insert("trades".to_string(), FieldValue::Integer(trades));
        TableRow {
            group_key: symbol.to_string(),
            window_start,
            values,
        }
    }

    fn within_condition(t: &InMemoryAggregateTable) -> CompiledTableCondition {
        let predicate = Expr::and(
            Expr::compare(
                Expr::column(system_columns::WITHIN_START),
                BinaryOperator::LessThanOrEqual,
                Expr::column(system_columns::AGG_TIMESTAMP),
            ),
            Expr::compare(
                Expr::column(system_columns::AGG_TIMESTAMP),
                BinaryOperator::LessThan,
                Expr::column(system_columns::WITHIN_END),
            ),
        );
        let lookup_shape = EventShape::new()
            .with_attribute(system_columns::WITHIN_START, FieldType::Integer)
            .with_attribute(system_columns::WITHIN_END, FieldType::Integer);
        t.compile_condition(&predicate, &lookup_shape).unwrap()
    }

    fn params(start: i64, end: i64) -> HashMap<String, FieldValue> {
        let mut p = HashMap::new();
        p.insert(
            system_columns::WITHIN_START.to_string(),
            FieldValue::Integer(start),
        );
        p.insert(
            system_columns::WITHIN_END.to_string(),
            FieldValue::Integer(end),
        );
        p
    }

    #[test]
    fn find_filters_by_timestamp_range() {
        let t = table();
        t.insert(row(0, "AAPL", 1)).unwrap();
        t.insert(row(1_000, "AAPL", 2)).unwrap();
        t.insert(row(2_000, "AAPL", 3)).unwrap();

        let condition = within_condition(&t);
        let matches = t.find(&condition, &params(1_000, 2_000)).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].window_start, 1_000);
    }

    #[test]
    fn insert_replaces_same_bucket() {
        let t = table();
        t.insert(row(0, "AAPL", 1)).unwrap();
        t.insert(row(0, "AAPL", 5)).unwrap();
        assert_eq!(t.row_count(), 1);
        let rows = t.snapshot().unwrap();
        assert_eq!(rows[0].values["trades"], FieldValue::Integer(5));
    }

    #[test]
    fn unknown_column_is_rejected() {
        let t = table();
        let mut bad = row(0, "AAPL", 1);
        bad.values
            .insert("mystery".to_string(), FieldValue::Integer(0));
        assert!(matches!(
            t.insert(bad),
            Err(TableError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn delete_where_reports_removed_count() {
        let t = table();
        t.insert(row(0, "AAPL", 1)).unwrap();
        t.insert(row(1_000, "AAPL", 2)).unwrap();
        let removed = t.delete_where(&|row| row.window_start < 1_000).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(t.row_count(), 1);
    }
}
