//! Error types for aggregation query compilation and execution.
//!
//! All fallible operations in the engine surface a [`SqlError`]. Compile-time
//! problems (missing `within`/`per`, type mismatches, invalid granularity
//! names) are reported synchronously when a query is compiled; runtime
//! problems are reported per call through the same type.

use std::fmt;

/// Error type for aggregation query compilation and execution.
///
/// Each variant carries the context needed to report the failure to the
/// embedding query engine: the offending column for schema errors, the
/// expected/actual types for type errors, the granularity for recovery
/// failures.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlError {
    /// Query construction errors: missing or malformed `within`/`per`
    /// clauses, unrecognized granularity names.
    ParseError {
        /// Human-readable error message
        message: String,
        /// Position in the query source, when known
        position: Option<usize>,
    },

    /// Column and shape validation errors raised while compiling an
    /// expression against an event shape.
    SchemaError {
        /// Description of the validation failure
        message: String,
        /// Name of the column that caused the error, if applicable
        column: Option<String>,
    },

    /// Runtime errors during event processing or retrieval.
    ExecutionError {
        /// Description of the execution failure
        message: String,
        /// Name of the query that failed, if available
        query: Option<String>,
    },

    /// Static type mismatches, e.g. a `per` expression that does not
    /// evaluate to a string.
    TypeError {
        /// Expected data type
        expected: String,
        /// Actual data type encountered
        actual: String,
        /// The value that caused the type error, if available
        value: Option<String>,
    },

    /// Failures while reconstructing executor state from the aggregate
    /// tables. Fatal to runtime startup: in-memory state cannot be
    /// guaranteed correct without a complete recovery pass.
    RecoveryError {
        /// Description of the recovery failure
        message: String,
        /// Granularity whose table could not be read, if applicable
        granularity: Option<String>,
    },
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlError::ParseError { message, position } => {
                if let Some(pos) = position {
                    write!(f, "SQL parse error at position {}: {}", pos, message)
                } else {
                    write!(f, "SQL parse error: {}", message)
                }
            }
            SqlError::SchemaError { message, column } => {
                if let Some(col) = column {
                    write!(f, "Schema error for column '{}': {}", col, message)
                } else {
                    write!(f, "Schema error: {}", message)
                }
            }
            SqlError::ExecutionError { message, query } => {
                if let Some(q) = query {
                    write!(f, "Execution error in '{}': {}", q, message)
                } else {
                    write!(f, "Execution error: {}", message)
                }
            }
            SqlError::TypeError {
                expected,
                actual,
                value,
            } => {
                if let Some(val) = value {
                    write!(
                        f,
                        "Type error: expected {}, got {} for value '{}'",
                        expected, actual, val
                    )
                } else {
                    write!(f, "Type error: expected {}, got {}", expected, actual)
                }
            }
            SqlError::RecoveryError {
                message,
                granularity,
            } => {
                if let Some(g) = granularity {
                    write!(f, "Recovery error for granularity {}: {}", g, message)
                } else {
                    write!(f, "Recovery error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for SqlError {}

impl SqlError {
    /// Create a parse error with optional position
    pub fn parse_error(message: impl Into<String>, position: Option<usize>) -> Self {
        SqlError::ParseError {
            message: message.into(),
            position,
        }
    }

    /// Create a schema error
    pub fn schema_error(message: impl Into<String>, column: Option<String>) -> Self {
        SqlError::SchemaError {
            message: message.into(),
            column,
        }
    }

    /// Create an execution error
    pub fn execution_error(message: impl Into<String>, query: Option<String>) -> Self {
        SqlError::ExecutionError {
            message: message.into(),
            query,
        }
    }

    /// Create a type error
    pub fn type_error(
        expected: impl Into<String>,
        actual: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        SqlError::TypeError {
            expected: expected.into(),
            actual: actual.into(),
            value,
        }
    }

    /// Create a recovery error
    pub fn recovery_error(message: impl Into<String>, granularity: Option<String>) -> Self {
        SqlError::RecoveryError {
            message: message.into(),
            granularity,
        }
    }
}

/// Result type for aggregation engine operations
pub type SqlResult<T> = Result<T, SqlError>;
