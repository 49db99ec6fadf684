//! Table-specific error types.

use crate::tempostream::sql::error::SqlError;

/// Errors raised by an aggregate table implementation
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// The table's backing store rejected or failed an operation
    #[error("Table '{table_name}' storage failure: {message}")]
    StorageFailure { table_name: String, message: String },

    /// Interior lock was poisoned by a panicking writer
    #[error("Table '{table_name}' lock poisoned during {operation}")]
    LockPoisoned {
        table_name: String,
        operation: &'static str,
    },

    /// A row did not match the table's schema
    #[error("Table '{table_name}' schema mismatch: {message}")]
    SchemaMismatch { table_name: String, message: String },
}

impl TableError {
    /// The table the error originated from
    pub fn table_name(&self) -> &str {
        match self {
            TableError::StorageFailure { table_name, .. }
            | TableError::LockPoisoned { table_name, .. }
            | TableError::SchemaMismatch { table_name, .. } => table_name,
        }
    }
}

impl From<TableError> for SqlError {
    fn from(error: TableError) -> Self {
        SqlError::execution_error(error.to_string(), None)
    }
}
