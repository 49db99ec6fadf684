//! The aggregation runtime: configuration, event intake, query compilation,
//! retrieval, and purging over one incremental aggregation definition.
//!
//! A runtime owns the executor chain, one table per granularity, the
//! recovery initialiser and the purger. Event batches go through
//! [`AggregationRuntime::process_events`] under the chain's write lock;
//! reads compile once via [`AggregationRuntime::compile_expression`] and
//! then run concurrently under the read lock.

use crate::tempostream::observability::{LatencySpan, LatencyTracker, MetricsLevel, ThroughputTracker};
use crate::tempostream::snapshot::SnapshotService;
use crate::tempostream::sql::ast::{Expr, Within};
use crate::tempostream::sql::error::SqlError;
use crate::tempostream::sql::execution::aggregation::accumulator::AggregateSpec;
use crate::tempostream::sql::execution::aggregation::compile::{
    compile_aggregate_expression, CompileInputs, IncrementalAggregateCompileCondition,
};
use crate::tempostream::sql::execution::aggregation::executor::{
    ExecutionContext, ExecutorChain, FieldGroupByKeyGenerator, GroupByKeyGenerator, ProcessResult,
};
use crate::tempostream::sql::execution::aggregation::granularity::TimeGranularity;
use crate::tempostream::sql::execution::aggregation::initializer::{
    IncrementalExecutorsInitialiser, RecoveryContext,
};
use crate::tempostream::sql::execution::aggregation::purger::{
    IncrementalDataPurger, PurgeSummary,
};
use crate::tempostream::sql::execution::expression::EventShape;
use crate::tempostream::sql::execution::types::{system_columns, FieldType, StreamRecord};
use crate::tempostream::table::{AggregateTable, InMemoryAggregateTable, TableSchema};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Definition of one incremental aggregation.
#[derive(Clone)]
pub struct AggregationConfig {
    /// Name of the aggregation, used for table naming and diagnostics
    pub aggregation_name: String,
    /// Shape of the input stream events
    pub input_shape: EventShape,
    /// Group-by fields; empty means a single global group
    pub group_by_fields: Vec<String>,
    /// Aggregate outputs to maintain
    pub aggregates: Vec<AggregateSpec>,
    /// Granularities to maintain, any order; normalized finest first
    pub granularities: Vec<TimeGranularity>,
    /// Retention horizon per granularity, in milliseconds
    pub retention_horizons: HashMap<TimeGranularity, i64>,
    /// Event attribute driving window assignment instead of arrival time
    pub external_time_field: Option<String>,
    /// Whether other nodes also write to the shared tables
    pub is_distributed: bool,
    pub metrics_level: MetricsLevel,
    /// Interval between purge passes; None uses the default
    pub purging_interval: Option<Duration>,
}

impl AggregationConfig {
    fn validate(&self) -> Result<Vec<TimeGranularity>, SqlError> {
        if self.granularities.is_empty() {
            return Err(SqlError::schema_error(
                format!(
                    "aggregation '{}' must maintain at least one granularity",
                    self.aggregation_name
                ),
                None,
            ));
        }
        let mut granularities = self.granularities.clone();
        granularities.sort();
        granularities.dedup();

        for field in &self.group_by_fields {
            if !self.input_shape.contains(field) {
                return Err(SqlError::schema_error(
                    "group-by field not found in input shape",
                    Some(field.clone()),
                ));
            }
        }
        if let Some(field) = &self.external_time_field {
            match self.input_shape.attribute_type(field) {
                Some(field_type) if field_type.is_numeric() => {}
                Some(field_type) => {
                    return Err(SqlError::type_error(
                        "INTEGER or TIMESTAMP",
                        field_type.name(),
                        Some(field.clone()),
                    ));
                }
                None => {
                    return Err(SqlError::schema_error(
                        "external time field not found in input shape",
                        Some(field.clone()),
                    ));
                }
            }
        }

        let mut seen = HashSet::new();
        for spec in &self.aggregates {
            if !seen.insert(spec.output_name.clone()) {
                return Err(SqlError::schema_error(
                    "duplicate aggregate output name",
                    Some(spec.output_name.clone()),
                ));
            }
            spec.base_columns(&self.input_shape)?;
        }
        Ok(granularities)
    }
}

/// Per-invocation context for retrieval calls
#[derive(Debug, Clone, Default)]
pub struct AggregationQueryContext {
    /// Name of the calling query, for diagnostics
    pub query_name: String,
    /// Evaluation instant override; None uses the wall clock
    pub reference_time: Option<i64>,
}

/// Point-in-time counters describing a runtime
#[derive(Debug, Clone)]
pub struct AggregationStats {
    pub events_observed: u64,
    pub find_invocations: u64,
    pub find_total_nanos: u64,
    /// Open in-memory buckets per granularity, finest first
    pub open_buckets: Vec<(TimeGranularity, usize)>,
    /// Persisted rows per granularity, finest first
    pub persisted_rows: Vec<(TimeGranularity, usize)>,
}

/// Build the persisted-row schema for an aggregation definition
pub fn build_table_schema(config: &AggregationConfig) -> Result<TableSchema, SqlError> {
    let mut attributes: Vec<(String, FieldType)> = vec![(
        system_columns::AGG_TIMESTAMP.to_string(),
        FieldType::Integer,
    )];
    if config.external_time_field.is_some() {
        attributes.push((
            system_columns::AGG_EVENT_TIMESTAMP.to_string(),
            FieldType::Integer,
        ));
        attributes.push((
            system_columns::AGG_LAST_EVENT_TIMESTAMP.to_string(),
            FieldType::Integer,
        ));
    }
    for field in &config.group_by_fields {
        let field_type = config.input_shape.attribute_type(field).ok_or_else(|| {
            SqlError::schema_error(
                "group-by field not found in input shape",
                Some(field.clone()),
            )
        })?;
        attributes.push((field.clone(), field_type));
    }
    for spec in &config.aggregates {
        attributes.extend(spec.base_columns(&config.input_shape)?);
    }
    Ok(TableSchema::new(attributes))
}

/// One live incremental aggregation.
pub struct AggregationRuntime {
    config: AggregationConfig,
    granularities: Vec<TimeGranularity>,
    table_schema: TableSchema,
    chain: RwLock<ExecutorChain>,
    tables: HashMap<TimeGranularity, Arc<dyn AggregateTable>>,
    key_generators: HashMap<TimeGranularity, Arc<dyn GroupByKeyGenerator>>,
    initialiser: IncrementalExecutorsInitialiser,
    purger: IncrementalDataPurger,
    first_event_arrived: AtomicBool,
    find_latency: LatencyTracker,
    throughput: ThroughputTracker,
}

impl AggregationRuntime {
    /// Build a runtime over caller-provided tables, one per granularity.
    pub fn new(
        config: AggregationConfig,
        tables: HashMap<TimeGranularity, Arc<dyn AggregateTable>>,
    ) -> Result<Self, SqlError> {
        let granularities = config.validate()?;
        for granularity in &granularities {
            if !tables.contains_key(granularity) {
                return Err(SqlError::schema_error(
                    format!(
                        "aggregation '{}' has no table for granularity {}",
                        config.aggregation_name, granularity
                    ),
                    None,
                ));
            }
        }
        let table_schema = build_table_schema(&config)?;

        let mut key_generators: HashMap<TimeGranularity, Arc<dyn GroupByKeyGenerator>> =
            HashMap::new();
        for granularity in &granularities {
            key_generators.insert(
                *granularity,
                Arc::new(FieldGroupByKeyGenerator::new(config.group_by_fields.clone())),
            );
        }

        let purger = IncrementalDataPurger::new(
            config.aggregation_name.clone(),
            config.retention_horizons.clone(),
            config.purging_interval,
        );
        let chain = ExecutorChain::new(&granularities);

        Ok(AggregationRuntime {
            granularities,
            table_schema,
            chain: RwLock::new(chain),
            tables,
            key_generators,
            initialiser: IncrementalExecutorsInitialiser::new(),
            purger,
            first_event_arrived: AtomicBool::new(false),
            find_latency: LatencyTracker::new(),
            throughput: ThroughputTracker::new(),
            config,
        })
    }

    /// Build a runtime backed by in-memory tables named
    /// `{aggregation}_{GRANULARITY}`.
    pub fn with_in_memory_tables(config: AggregationConfig) -> Result<Self, SqlError> {
        let granularities = config.validate()?;
        let table_schema = build_table_schema(&config)?;
        let mut tables: HashMap<TimeGranularity, Arc<dyn AggregateTable>> = HashMap::new();
        for granularity in &granularities {
            tables.insert(
                *granularity,
                Arc::new(InMemoryAggregateTable::new(
                    format!("{}_{}", config.aggregation_name, granularity),
                    table_schema.clone(),
                )),
            );
        }
        Self::new(config, tables)
    }

    pub fn aggregation_name(&self) -> &str {
        &self.config.aggregation_name
    }

    /// Maintained granularities, finest first
    pub fn granularities(&self) -> &[TimeGranularity] {
        &self.granularities
    }

    /// Schema of the persisted rows
    pub fn table_schema(&self) -> &TableSchema {
        &self.table_schema
    }

    /// Table backing one granularity
    pub fn table(&self, granularity: TimeGranularity) -> Option<&Arc<dyn AggregateTable>> {
        self.tables.get(&granularity)
    }

    /// Interval the embedding engine should schedule purge passes at
    pub fn purging_interval(&self) -> Duration {
        self.purger.purging_interval()
    }

    /// Feed a batch of stream events through the executor chain.
    ///
    /// The first batch triggers executor recovery before anything is
    /// aggregated. Records failing evaluation are dropped individually and
    /// counted in the result; the batch itself never fails half-way.
    pub fn process_events(&self, batch: &[StreamRecord]) -> Result<ProcessResult, SqlError> {
        if batch.is_empty() {
            return Ok(ProcessResult::default());
        }
        if self.config.metrics_level >= MetricsLevel::Basic {
            self.throughput.events_in(batch.len() as u64);
        }

        let mut chain = self.chain.write().map_err(|_| self.lock_error("write"))?;
        if self
            .first_event_arrived
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if self.config.is_distributed {
                // Shared tables hold rows from every node; seeding local
                // buckets from them would double-count on the next rollover.
                chain.set_processing(true);
            } else {
                let now = self.driving_time_of(&batch[0]);
                self.initialiser
                    .initialise(&mut chain, &self.recovery_context(), now)?;
            }
        }

        let ctx = self.execution_context();
        let result = chain.execute(batch, &ctx);
        debug!(
            "aggregation '{}': batch of {} processed, {} accepted, {} dropped",
            self.config.aggregation_name,
            batch.len(),
            result.accepted,
            result.failed
        );
        Ok(result)
    }

    /// Compile a retrieval plan for this aggregation.
    pub fn compile_expression(
        &self,
        on_condition: &Expr,
        within: Option<&Within>,
        per: Option<&Expr>,
        matching_shape: &EventShape,
    ) -> Result<IncrementalAggregateCompileCondition, SqlError> {
        let inputs = CompileInputs {
            aggregation_name: &self.config.aggregation_name,
            is_processing_on_external_time: self.config.external_time_field.is_some(),
            is_distributed: self.config.is_distributed,
            granularities: &self.granularities,
            tables: &self.tables,
            table_schema: &self.table_schema,
            specs: &self.config.aggregates,
            group_fields: &self.config.group_by_fields,
            input_shape: &self.config.input_shape,
        };
        compile_aggregate_expression(on_condition, within, per, matching_shape, &inputs)
    }

    /// Run a compiled retrieval plan.
    ///
    /// State storage is suspended for the duration of the call so the read
    /// leaves no trace in checkpoints. On a node that has not yet seen an
    /// event, recovery runs first so reads observe restored buckets.
    pub fn find(
        &self,
        compiled: &IncrementalAggregateCompileCondition,
        matching_event: &StreamRecord,
        query_ctx: &AggregationQueryContext,
    ) -> Result<Vec<StreamRecord>, SqlError> {
        let _skip = SnapshotService::skip_state_guard();
        let _span: Option<LatencySpan<'_>> = if self.config.metrics_level >= MetricsLevel::Basic {
            Some(self.find_latency.track())
        } else {
            None
        };
        let now = query_ctx.reference_time.unwrap_or_else(current_time_millis);

        // Shared tables are recovered by the writing nodes; a read-only
        // node must not seed local buckets from them.
        if !self.config.is_distributed
            && !self.first_event_arrived.load(Ordering::Acquire)
            && !self.initialiser.is_initialised()
        {
            let mut chain = self.chain.write().map_err(|_| self.lock_error("write"))?;
            self.initialiser
                .initialise(&mut chain, &self.recovery_context(), now)?;
        }

        let chain = self.chain.read().map_err(|_| self.lock_error("read"))?;
        compiled.find(matching_event, &chain, &self.tables, now)
    }

    /// Run executor recovery ahead of the first event, e.g. during a warm
    /// standby's startup. A no-op once recovery has run.
    pub fn initialise_executors(&self) -> Result<(), SqlError> {
        let mut chain = self.chain.write().map_err(|_| self.lock_error("write"))?;
        if self.config.is_distributed {
            chain.set_processing(true);
            return Ok(());
        }
        self.initialiser
            .initialise(&mut chain, &self.recovery_context(), current_time_millis())
    }

    /// Run one retention purge pass at the wall-clock instant
    pub fn run_purge(&self) -> Result<PurgeSummary, SqlError> {
        self.run_purge_at(current_time_millis())
    }

    /// Run one retention purge pass at an explicit instant
    pub fn run_purge_at(&self, now: i64) -> Result<PurgeSummary, SqlError> {
        let mut chain = self.chain.write().map_err(|_| self.lock_error("write"))?;
        Ok(self.purger.execute(&mut chain, &self.tables, now))
    }

    /// Point-in-time counters for this runtime
    pub fn stats(&self) -> Result<AggregationStats, SqlError> {
        let chain = self.chain.read().map_err(|_| self.lock_error("read"))?;
        let open_buckets = self
            .granularities
            .iter()
            .enumerate()
            .map(|(index, g)| {
                (
                    *g,
                    chain.stage(index).map_or(0, |stage| stage.open_bucket_count()),
                )
            })
            .collect();
        let persisted_rows = self
            .granularities
            .iter()
            .map(|g| (*g, self.tables.get(g).map_or(0, |t| t.row_count())))
            .collect();
        Ok(AggregationStats {
            events_observed: self.throughput.events(),
            find_invocations: self.find_latency.invocations(),
            find_total_nanos: self.find_latency.total_nanos(),
            open_buckets,
            persisted_rows,
        })
    }

    fn execution_context(&self) -> ExecutionContext<'_> {
        ExecutionContext {
            tables: &self.tables,
            key_generators: &self.key_generators,
            specs: &self.config.aggregates,
            group_fields: &self.config.group_by_fields,
            external_time_field: self.config.external_time_field.as_deref(),
            aggregation_name: &self.config.aggregation_name,
        }
    }

    fn recovery_context(&self) -> RecoveryContext<'_> {
        RecoveryContext {
            tables: &self.tables,
            key_generators: &self.key_generators,
            specs: &self.config.aggregates,
            group_fields: &self.config.group_by_fields,
            aggregation_name: &self.config.aggregation_name,
        }
    }

    fn driving_time_of(&self, record: &StreamRecord) -> i64 {
        match &self.config.external_time_field {
            Some(field) => record
                .fields
                .get(field)
                .and_then(|v| v.as_millis())
                .unwrap_or(record.timestamp),
            None => record.timestamp,
        }
    }

    fn lock_error(&self, operation: &str) -> SqlError {
        SqlError::execution_error(
            format!("executor chain {} lock poisoned", operation),
            Some(self.config.aggregation_name.clone()),
        )
    }
}

fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
