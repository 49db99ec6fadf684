pub mod aggregation;
pub mod expression;
pub mod types;

pub use expression::{EventShape, ExecutableExpression};
pub use types::{FieldType, FieldValue, StreamRecord};
