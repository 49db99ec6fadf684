pub mod observability;
pub mod snapshot;
pub mod sql;
pub mod table;

// Re-export the runtime surface for embedders and tests
pub use sql::error::SqlError;
pub use sql::execution::aggregation::runtime::{
    AggregationConfig, AggregationQueryContext, AggregationRuntime, AggregationStats,
};
