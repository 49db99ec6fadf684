// Incremental aggregation: the granularity ladder, bucket accumulators,
// executor chain, query compilation, recovery, purging, and the runtime
// that ties them together.

pub mod accumulator;
pub mod compile;
pub mod executor;
pub mod granularity;
pub mod initializer;
pub mod purger;
pub mod runtime;

pub use accumulator::{AggregateFunction, AggregateSpec, BucketAccumulator};
pub use compile::{CompileInputs, IncrementalAggregateCompileCondition};
pub use executor::{ExecutorChain, FieldGroupByKeyGenerator, GroupByKeyGenerator, ProcessResult};
pub use granularity::{normalize_duration, TimeGranularity};
pub use initializer::IncrementalExecutorsInitialiser;
pub use purger::{IncrementalDataPurger, PurgeOutcome, PurgeSummary};
pub use runtime::{
    AggregationConfig, AggregationQueryContext, AggregationRuntime, AggregationStats,
};
