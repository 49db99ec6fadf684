//! # tempostream
//!
//! Incremental time-series aggregation for streaming query engines: events
//! are folded into per-granularity buckets (seconds through years) as they
//! arrive, closed buckets are persisted per granularity, and reads answer
//! `within`/`per` range queries by uniting persisted rows with the
//! still-open in-memory buckets.
//!
//! ## Quick Start
//!
//! ```rust
//! use tempostream::tempostream::sql::ast::{Expr, Within};
//! use tempostream::tempostream::sql::execution::aggregation::{
//!     AggregateSpec, AggregationConfig, AggregationQueryContext, AggregationRuntime,
//!     TimeGranularity,
//! };
//! use tempostream::tempostream::sql::execution::{EventShape, FieldType, FieldValue, StreamRecord};
//! use tempostream::tempostream::observability::MetricsLevel;
//! use std::collections::HashMap;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AggregationConfig {
//!         aggregation_name: "trade_agg".to_string(),
//!         input_shape: EventShape::new()
//!             .with_attribute("symbol", FieldType::String)
//!             .with_attribute("volume", FieldType::Integer),
//!         group_by_fields: vec!["symbol".to_string()],
//!         aggregates: vec![
//!             AggregateSpec::count("trades"),
//!             AggregateSpec::sum("volume_total", "volume"),
//!         ],
//!         granularities: vec![TimeGranularity::Seconds, TimeGranularity::Minutes],
//!         retention_horizons: HashMap::new(),
//!         external_time_field: None,
//!         is_distributed: false,
//!         metrics_level: MetricsLevel::Off,
//!         purging_interval: None,
//!     };
//!     let runtime = AggregationRuntime::with_in_memory_tables(config)?;
//!
//!     let mut fields = HashMap::new();
//!     fields.insert("symbol".to_string(), FieldValue::String("AAPL".into()));
//!     fields.insert("volume".to_string(), FieldValue::Integer(10));
//!     runtime.process_events(&[StreamRecord::new(0, fields)])?;
//!
//!     let compiled = runtime.compile_expression(
//!         &Expr::boolean(true),
//!         Some(&Within::starting_at(Expr::integer(0))),
//!         Some(&Expr::string("seconds")),
//!         &EventShape::new(),
//!     )?;
//!     let ctx = AggregationQueryContext {
//!         query_name: "trades_per_second".to_string(),
//!         reference_time: Some(5_000),
//!     };
//!     let rows = runtime.find(&compiled, &StreamRecord::new(0, HashMap::new()), &ctx)?;
//!     assert_eq!(rows.len(), 1);
//!     Ok(())
//! }
//! ```

pub mod tempostream;

// Re-export the primary API at the crate root
pub use tempostream::sql::ast::{Expr, Within};
pub use tempostream::sql::error::{SqlError, SqlResult};
pub use tempostream::sql::execution::aggregation::{
    AggregateFunction, AggregateSpec, AggregationConfig, AggregationQueryContext,
    AggregationRuntime, AggregationStats, TimeGranularity,
};
pub use tempostream::sql::execution::{EventShape, FieldType, FieldValue, StreamRecord};
