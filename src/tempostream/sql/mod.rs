// Aggregation query surface: AST fragments, errors, and the incremental
// execution engine.

pub mod ast;
pub mod error;
pub mod execution;

// Re-export main API
pub use ast::{Expr, Within};
pub use error::{SqlError, SqlResult};
pub use execution::types::{FieldValue, StreamRecord};
