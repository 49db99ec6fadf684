//! Query-compile-time plan construction for aggregation retrieval.
//!
//! `compile_aggregate_expression` turns a (`on`, `within`, `per`) triple into
//! an [`IncrementalAggregateCompileCondition`]: per-granularity table
//! filters, one in-memory filter of the same shape, the distributed boundary
//! filters, the join condition compiled against the combined event shape,
//! and the output projection. The plan is immutable and reused across every
//! invocation of the query; at lookup time it only *reads* runtime-owned
//! state handed to it by granularity index.
//!
//! Retrieval decomposes the requested range across the ladder: closed
//! buckets come from the requested granularity's table, the not-yet-closed
//! remainder is assembled on the fly from the open buckets of the finer
//! executors (and, in distributed mode, from boundary-filtered finer table
//! rows), then everything is merged per (window, group key), joined against
//! the `on` condition and projected.

use crate::tempostream::sql::ast::{BinaryOperator, Expr, LiteralValue, Within};
use crate::tempostream::sql::error::SqlError;
use crate::tempostream::sql::execution::aggregation::accumulator::{
    AggregateSpec, BucketAccumulator,
};
use crate::tempostream::sql::execution::aggregation::executor::ExecutorChain;
use crate::tempostream::sql::execution::aggregation::granularity::{
    normalize_duration, start_time_end_time, TimeGranularity,
};
use crate::tempostream::sql::execution::expression::{
    parse_expression, reduce_expression_for_attributes, EventShape, ExecutableExpression,
};
use crate::tempostream::sql::execution::types::{
    system_columns, FieldType, FieldValue, StreamRecord,
};
use crate::tempostream::table::{
    compile_table_condition, AggregateTable, CompiledTableCondition, TableRow, TableSchema,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Everything the builder needs from the aggregation runtime
pub struct CompileInputs<'a> {
    pub aggregation_name: &'a str,
    pub is_processing_on_external_time: bool,
    pub is_distributed: bool,
    pub granularities: &'a [TimeGranularity],
    pub tables: &'a HashMap<TimeGranularity, Arc<dyn AggregateTable>>,
    pub table_schema: &'a TableSchema,
    pub specs: &'a [AggregateSpec],
    pub group_fields: &'a [String],
    pub input_shape: &'a EventShape,
}

/// Immutable retrieval plan for one compiled aggregation query
#[derive(Debug)]
pub struct IncrementalAggregateCompileCondition {
    aggregation_name: String,
    is_processing_on_external_time: bool,
    is_distributed: bool,
    granularities: Vec<TimeGranularity>,
    within_table_conditions: HashMap<TimeGranularity, CompiledTableCondition>,
    in_memory_condition: CompiledTableCondition,
    lower_granularity_conditions: HashMap<TimeGranularity, CompiledTableCondition>,
    on_condition: ExecutableExpression,
    per_executor: ExecutableExpression,
    start_executor: ExecutableExpression,
    end_executor: Option<ExecutableExpression>,
    projection: OutputProjection,
    specs: Vec<AggregateSpec>,
    group_fields: Vec<String>,
}

/// Computes the final output attributes from a merged aggregate row
#[derive(Debug, Clone)]
struct OutputProjection {
    specs: Vec<AggregateSpec>,
    external_time: bool,
}

impl OutputProjection {
    fn project(&self, merged: &MergedAggregate) -> StreamRecord {
        let mut fields = merged.accumulator.finalize(&self.specs);
        for (name, value) in &merged.group_values {
            fields.insert(name.clone(), value.clone());
        }
        fields.insert(
            system_columns::AGG_TIMESTAMP.to_string(),
            FieldValue::Integer(merged.window_start),
        );
        if self.external_time {
            fields.insert(
                system_columns::AGG_EVENT_TIMESTAMP.to_string(),
                FieldValue::Integer(merged.window_start),
            );
        }
        StreamRecord::new(merged.window_start, fields)
    }
}

/// One requested-granularity bucket assembled from candidate rows
struct MergedAggregate {
    window_start: i64,
    group_values: HashMap<String, FieldValue>,
    accumulator: BucketAccumulator,
}

/// Build the retrieval plan. Fails deterministically when `within` or `per`
/// is absent, when `per` is not string-typed, or when a literal `per` value
/// is not a recognized granularity name.
pub fn compile_aggregate_expression(
    on_condition: &Expr,
    within: Option<&Within>,
    per: Option<&Expr>,
    matching_shape: &EventShape,
    inputs: &CompileInputs<'_>,
) -> Result<IncrementalAggregateCompileCondition, SqlError> {
    let per = per.ok_or_else(|| {
        SqlError::parse_error(
            "aggregation read query must contain a `per` definition for granularity",
            None,
        )
    })?;
    let within = within.ok_or_else(|| {
        SqlError::parse_error(
            "aggregation read query must contain a `within` definition for filtering \
             of aggregation data",
            None,
        )
    })?;

    // `per` must be string-typed; a literal value is verified immediately
    let per_executor = parse_expression(per, matching_shape)?;
    if per_executor.return_type() != FieldType::String {
        return Err(SqlError::type_error(
            FieldType::String.name(),
            per_executor.return_type().name(),
            None,
        ));
    }
    if let Some(LiteralValue::String(value)) = per_executor.as_constant() {
        normalize_duration(value)?;
    }

    let start_executor = compile_time_bound(&within.start, matching_shape)?;
    let end_executor = match &within.end {
        Some(end) => Some(compile_time_bound(end, matching_shape)?),
        None => None,
    };

    let granularity_count = inputs.granularities.len();
    // Exactly N-1 boundary filters for N granularities, one per adjacent
    // pair below the coarsest.
    let boundary_pairs = granularity_count.saturating_sub(1);

    let mut lookup_shape = EventShape::new()
        .with_attribute(system_columns::WITHIN_START, FieldType::Integer)
        .with_attribute(system_columns::WITHIN_END, FieldType::Integer);
    if inputs.is_distributed {
        for index in 0..boundary_pairs {
            lookup_shape.set_attribute(system_columns::timestamp_filter(index), FieldType::Integer);
        }
    }

    let time_column = if inputs.is_processing_on_external_time {
        system_columns::AGG_EVENT_TIMESTAMP
    } else {
        system_columns::AGG_TIMESTAMP
    };
    let within_expr = Expr::and(
        Expr::compare(
            Expr::column(system_columns::WITHIN_START),
            BinaryOperator::LessThanOrEqual,
            Expr::column(time_column),
        ),
        Expr::compare(
            Expr::column(time_column),
            BinaryOperator::LessThan,
            Expr::column(system_columns::WITHIN_END),
        ),
    );

    let mut available: HashSet<String> = inputs
        .table_schema
        .attribute_names()
        .map(str::to_string)
        .collect();
    available.extend(lookup_shape.attribute_names().map(str::to_string));
    let reduced_on = reduce_expression_for_attributes(on_condition, &available);

    let table_predicate = match &reduced_on {
        Some(reduced) => Expr::and(within_expr.clone(), reduced.clone()),
        None => within_expr,
    };

    let mut within_table_conditions = HashMap::new();
    for granularity in inputs.granularities {
        let table = expect_table(inputs, *granularity)?;
        let condition = table.compile_condition(&table_predicate, &lookup_shape)?;
        within_table_conditions.insert(*granularity, condition);
    }

    let in_memory_condition =
        compile_table_condition(&table_predicate, inputs.table_schema, &lookup_shape)?;

    let mut lower_granularity_conditions = HashMap::new();
    if inputs.is_distributed {
        for index in 0..boundary_pairs {
            let granularity = inputs.granularities[index];
            let boundary_expr = Expr::and(
                Expr::compare(
                    Expr::column(system_columns::AGG_TIMESTAMP),
                    BinaryOperator::GreaterThanOrEqual,
                    Expr::column(system_columns::timestamp_filter(index)),
                ),
                table_predicate.clone(),
            );
            let table = expect_table(inputs, granularity)?;
            let condition = table.compile_condition(&boundary_expr, &lookup_shape)?;
            lower_granularity_conditions.insert(granularity, condition);
        }
    }

    // The `on` condition sees the full combined shape: the matching stream
    // event, the synthetic lookup attributes, and the aggregation's output
    // attributes.
    let mut combined_shape = matching_shape.clone();
    combined_shape.extend(&lookup_shape);
    combined_shape.extend(&output_shape(inputs)?);
    let on_compiled = parse_expression(on_condition, &combined_shape)?;

    Ok(IncrementalAggregateCompileCondition {
        aggregation_name: inputs.aggregation_name.to_string(),
        is_processing_on_external_time: inputs.is_processing_on_external_time,
        is_distributed: inputs.is_distributed,
        granularities: inputs.granularities.to_vec(),
        within_table_conditions,
        in_memory_condition,
        lower_granularity_conditions,
        on_condition: on_compiled,
        per_executor,
        start_executor,
        end_executor,
        projection: OutputProjection {
            specs: inputs.specs.to_vec(),
            external_time: inputs.is_processing_on_external_time,
        },
        specs: inputs.specs.to_vec(),
        group_fields: inputs.group_fields.to_vec(),
    })
}

fn compile_time_bound(
    expr: &Expr,
    matching_shape: &EventShape,
) -> Result<ExecutableExpression, SqlError> {
    let compiled = parse_expression(expr, matching_shape)?;
    if !compiled.return_type().is_numeric() {
        return Err(SqlError::type_error(
            "INTEGER or TIMESTAMP",
            compiled.return_type().name(),
            None,
        ));
    }
    Ok(compiled)
}

fn expect_table<'a>(
    inputs: &'a CompileInputs<'_>,
    granularity: TimeGranularity,
) -> Result<&'a Arc<dyn AggregateTable>, SqlError> {
    inputs.tables.get(&granularity).ok_or_else(|| {
        SqlError::schema_error(
            format!(
                "aggregation '{}' maintains no table for granularity {}",
                inputs.aggregation_name, granularity
            ),
            None,
        )
    })
}

/// Shape of the aggregation's output attributes: group fields, finalized
/// aggregate values, and the timestamp columns.
fn output_shape(inputs: &CompileInputs<'_>) -> Result<EventShape, SqlError> {
    let mut shape = EventShape::new()
        .with_attribute(system_columns::AGG_TIMESTAMP, FieldType::Integer);
    if inputs.is_processing_on_external_time {
        shape.set_attribute(system_columns::AGG_EVENT_TIMESTAMP, FieldType::Integer);
    }
    for field in inputs.group_fields {
        let field_type = inputs.input_shape.attribute_type(field).ok_or_else(|| {
            SqlError::schema_error(
                "group-by field not found in input shape",
                Some(field.clone()),
            )
        })?;
        shape.set_attribute(field.clone(), field_type);
    }
    for spec in inputs.specs {
        let (name, field_type) = spec.output_attribute(inputs.input_shape)?;
        shape.set_attribute(name, field_type);
    }
    Ok(shape)
}

impl IncrementalAggregateCompileCondition {
    /// Maintained granularities, finest first
    pub fn granularities(&self) -> &[TimeGranularity] {
        &self.granularities
    }

    /// Number of distributed boundary filters held by this plan
    pub fn boundary_filter_count(&self) -> usize {
        self.lower_granularity_conditions.len()
    }

    /// Retrieve matching aggregates for one invocation.
    ///
    /// `chain` and `tables` are the runtime's own state, handed in per call;
    /// the plan never holds references into the runtime.
    pub fn find(
        &self,
        matching_event: &StreamRecord,
        chain: &ExecutorChain,
        tables: &HashMap<TimeGranularity, Arc<dyn AggregateTable>>,
        now: i64,
    ) -> Result<Vec<StreamRecord>, SqlError> {
        let per = self.resolve_per(matching_event)?;
        let per_index = self
            .granularities
            .iter()
            .position(|g| *g == per)
            .ok_or_else(|| {
                SqlError::execution_error(
                    format!(
                        "per granularity {} is not maintained by aggregation '{}'",
                        per, self.aggregation_name
                    ),
                    None,
                )
            })?;

        let (start, end) = self.resolve_within(matching_event, now)?;
        let parameters = self.lookup_parameters(start, end, now);

        let mut candidates: Vec<TableRow> = Vec::new();

        // Closed buckets at the requested granularity
        let per_table = tables.get(&per).ok_or_else(|| {
            SqlError::execution_error(
                format!("no table registered for granularity {}", per),
                Some(self.aggregation_name.clone()),
            )
        })?;
        let per_condition = self.within_table_conditions.get(&per).ok_or_else(|| {
            SqlError::execution_error(
                format!("plan holds no table condition for granularity {}", per),
                Some(self.aggregation_name.clone()),
            )
        })?;
        candidates.extend(per_table.find(per_condition, &parameters)?);

        // Open buckets, base granularity up to the requested one. On a
        // distributed shard a coarse bucket for the current window
        // duplicates the finer table rows the boundary scan below returns,
        // so above the base only buckets from earlier windows contribute:
        // their finer rows fall below the boundary cutoff and nothing else
        // covers them.
        for stage_index in 0..=per_index {
            let stage = match chain.stage(stage_index) {
                Some(stage) => stage,
                None => continue,
            };
            let superseded_from = if self.is_distributed && stage_index > 0 {
                Some(self.granularities[stage_index].window_start(now))
            } else {
                None
            };
            for bucket in stage.open_buckets() {
                if let Some(cutoff) = superseded_from {
                    if bucket.window_start >= cutoff {
                        continue;
                    }
                }
                let row = bucket.to_row(&self.specs, self.is_processing_on_external_time);
                if self.in_memory_condition.matches(&row, &parameters)? {
                    candidates.push(row);
                }
            }
        }

        // Distributed reconciliation: the span not yet rolled up into the
        // requested granularity lives in finer tables, guarded by the
        // boundary cutoffs so already-superseded rows stay out.
        if self.is_distributed {
            for index in 0..per_index {
                let granularity = self.granularities[index];
                if let (Some(condition), Some(table)) = (
                    self.lower_granularity_conditions.get(&granularity),
                    tables.get(&granularity),
                ) {
                    candidates.extend(table.find(condition, &parameters)?);
                }
            }
        }

        let merged = self.merge_candidates(candidates, per)?;

        let mut results = Vec::new();
        for aggregate in merged.values() {
            let projected = self.projection.project(aggregate);
            let mut combined = matching_event.fields.clone();
            for (name, value) in &projected.fields {
                combined.insert(name.clone(), value.clone());
            }
            for (name, value) in &parameters {
                combined.insert(name.clone(), value.clone());
            }
            if self.on_condition.evaluate_bool(&combined)? {
                results.push(projected);
            }
        }
        Ok(results)
    }

    fn resolve_per(&self, matching_event: &StreamRecord) -> Result<TimeGranularity, SqlError> {
        let value = self.per_executor.evaluate(&matching_event.fields)?;
        match value {
            FieldValue::String(name) => normalize_duration(&name),
            other => Err(SqlError::type_error(
                FieldType::String.name(),
                other.type_name(),
                Some(other.to_string()),
            )),
        }
    }

    fn resolve_within(
        &self,
        matching_event: &StreamRecord,
        now: i64,
    ) -> Result<(i64, i64), SqlError> {
        let start = self
            .start_executor
            .evaluate(&matching_event.fields)?
            .as_millis()
            .ok_or_else(|| {
                SqlError::execution_error("within start did not evaluate to a time", None)
            })?;
        let end = match &self.end_executor {
            Some(executor) => Some(
                executor
                    .evaluate(&matching_event.fields)?
                    .as_millis()
                    .ok_or_else(|| {
                        SqlError::execution_error("within end did not evaluate to a time", None)
                    })?,
            ),
            None => None,
        };
        start_time_end_time(start, end, now)
    }

    fn lookup_parameters(&self, start: i64, end: i64, now: i64) -> HashMap<String, FieldValue> {
        let mut parameters = HashMap::new();
        parameters.insert(
            system_columns::WITHIN_START.to_string(),
            FieldValue::Integer(start),
        );
        parameters.insert(
            system_columns::WITHIN_END.to_string(),
            FieldValue::Integer(end),
        );
        if self.is_distributed {
            for index in 0..self.granularities.len().saturating_sub(1) {
                let coarser = self.granularities[index + 1];
                parameters.insert(
                    system_columns::timestamp_filter(index),
                    FieldValue::Integer(coarser.window_start(now)),
                );
            }
        }
        parameters
    }

    /// Merge candidate rows into requested-granularity buckets, keyed by
    /// (window start, group key). Candidates merge in ascending time order
    /// so FIRST/LAST keep their meaning across levels.
    fn merge_candidates(
        &self,
        mut candidates: Vec<TableRow>,
        per: TimeGranularity,
    ) -> Result<BTreeMap<(i64, String), MergedAggregate>, SqlError> {
        let time_column = if self.is_processing_on_external_time {
            system_columns::AGG_EVENT_TIMESTAMP
        } else {
            system_columns::AGG_TIMESTAMP
        };
        candidates.sort_by_key(|row| {
            row.values
                .get(time_column)
                .and_then(|v| v.as_millis())
                .unwrap_or(row.window_start)
        });

        let mut merged: BTreeMap<(i64, String), MergedAggregate> = BTreeMap::new();
        for row in candidates {
            let row_time = row
                .values
                .get(time_column)
                .and_then(|v| v.as_millis())
                .unwrap_or(row.window_start);
            let window_start = per.window_start(row_time);
            let contribution = BucketAccumulator::from_row(&row.values, &self.specs)?;

            let entry = merged
                .entry((window_start, row.group_key.clone()))
                .or_insert_with(|| MergedAggregate {
                    window_start,
                    group_values: self
                        .group_fields
                        .iter()
                        .map(|field| {
                            (
                                field.clone(),
                                row.values.get(field).cloned().unwrap_or(FieldValue::Null),
                            )
                        })
                        .collect(),
                    accumulator: BucketAccumulator::new(),
                });
            entry.accumulator.merge(&contribution);
        }
        Ok(merged)
    }
}
