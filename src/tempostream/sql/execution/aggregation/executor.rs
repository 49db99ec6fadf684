//! The incremental executor chain: one executor per maintained granularity,
//! finest to coarsest, cascading completed buckets upward.
//!
//! The base executor consumes raw stream events; every coarser executor
//! consumes the completed-bucket records of the level below it. Crossing a
//! window boundary closes the open buckets: each is written to the
//! granularity's table and pushed into the next-coarser stage, then a fresh
//! window opens. The chain is an explicit list of stages addressed by index,
//! so adjacent levels never hold references to each other.

use crate::tempostream::sql::error::SqlError;
use crate::tempostream::sql::execution::aggregation::accumulator::{
    AggregateSpec, BucketAccumulator,
};
use crate::tempostream::sql::execution::aggregation::granularity::TimeGranularity;
use crate::tempostream::sql::execution::types::{system_columns, FieldValue, StreamRecord};
use crate::tempostream::table::{AggregateTable, TableRow};
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Separator between group field values inside a composite key. A control
/// character keeps user strings containing separators from colliding.
const KEY_DELIMITER: char = '\u{001f}';

/// Deterministic function from a record's fields to its group-by key
pub trait GroupByKeyGenerator: Send + Sync {
    fn group_key(&self, fields: &HashMap<String, FieldValue>) -> Result<String, SqlError>;
}

/// Key generator concatenating the configured group-by field values.
/// Works unchanged for raw events and completed-bucket records, since group
/// fields are carried through on every bucket row.
pub struct FieldGroupByKeyGenerator {
    fields: Vec<String>,
}

impl FieldGroupByKeyGenerator {
    pub fn new(fields: Vec<String>) -> Self {
        FieldGroupByKeyGenerator { fields }
    }
}

impl GroupByKeyGenerator for FieldGroupByKeyGenerator {
    fn group_key(&self, fields: &HashMap<String, FieldValue>) -> Result<String, SqlError> {
        let mut key = String::new();
        for (index, field) in self.fields.iter().enumerate() {
            if index > 0 {
                key.push(KEY_DELIMITER);
            }
            match fields.get(field) {
                Some(value) => key.push_str(&value.to_string()),
                None => key.push_str("NULL"),
            }
        }
        Ok(key)
    }
}

/// One open aggregate window for one group key
#[derive(Debug, Clone)]
pub struct Bucket {
    pub group_key: String,
    pub granularity: TimeGranularity,
    pub window_start: i64,
    /// Group-by field values captured when the bucket opened
    pub group_values: HashMap<String, FieldValue>,
    /// Latest contributing event time (external-time mode)
    pub last_event_timestamp: Option<i64>,
    pub accumulator: BucketAccumulator,
}

impl Bucket {
    fn open(granularity: TimeGranularity, window_start: i64, group_key: String) -> Self {
        Bucket {
            group_key,
            granularity,
            window_start,
            group_values: HashMap::new(),
            last_event_timestamp: None,
            accumulator: BucketAccumulator::new(),
        }
    }

    /// Exclusive end of this bucket's window
    pub fn window_end(&self) -> i64 {
        self.granularity.window_end(self.window_start)
    }

    /// Persisted-row form of this bucket: group fields, base aggregate
    /// columns, and the timestamp columns.
    pub fn to_row(&self, specs: &[AggregateSpec], external_time: bool) -> TableRow {
        let mut values = self.accumulator.to_row_values(specs);
        for (name, value) in &self.group_values {
            values.insert(name.clone(), value.clone());
        }
        values.insert(
            system_columns::AGG_TIMESTAMP.to_string(),
            FieldValue::Integer(self.window_start),
        );
        if external_time {
            values.insert(
                system_columns::AGG_EVENT_TIMESTAMP.to_string(),
                FieldValue::Integer(self.window_start),
            );
            values.insert(
                system_columns::AGG_LAST_EVENT_TIMESTAMP.to_string(),
                match self.last_event_timestamp {
                    Some(ts) => FieldValue::Integer(ts),
                    None => FieldValue::Null,
                },
            );
        }
        TableRow {
            group_key: self.group_key.clone(),
            window_start: self.window_start,
            values,
        }
    }
}

/// Runtime-owned collaborators the chain needs while executing a batch
pub struct ExecutionContext<'a> {
    pub tables: &'a HashMap<TimeGranularity, Arc<dyn AggregateTable>>,
    pub key_generators: &'a HashMap<TimeGranularity, Arc<dyn GroupByKeyGenerator>>,
    pub specs: &'a [AggregateSpec],
    pub group_fields: &'a [String],
    pub external_time_field: Option<&'a str>,
    pub aggregation_name: &'a str,
}

/// Outcome of one `process_events` batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessResult {
    /// Records aggregated successfully
    pub accepted: usize,
    /// Records dropped by a failing key or aggregate evaluation
    pub failed: usize,
}

/// Per-granularity rollover state machine.
///
/// Invariant: at most one open bucket per group key, and every open bucket
/// belongs to the current window. Crossing the boundary closes all of them
/// before any record of the new window is aggregated.
pub struct IncrementalExecutor {
    granularity: TimeGranularity,
    is_root: bool,
    is_processing_executor: bool,
    buckets: HashMap<String, Bucket>,
    next_emit_time: Option<i64>,
}

impl IncrementalExecutor {
    fn new(granularity: TimeGranularity, is_root: bool) -> Self {
        IncrementalExecutor {
            granularity,
            is_root,
            // Dormant until first-event recovery marks the chain live
            is_processing_executor: false,
            buckets: HashMap::new(),
            next_emit_time: None,
        }
    }

    pub fn granularity(&self) -> TimeGranularity {
        self.granularity
    }

    /// Live executors accumulate; dormant ones pass records through to
    /// persistence only.
    pub fn set_processing(&mut self, live: bool) {
        self.is_processing_executor = live;
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing_executor
    }

    /// Currently open buckets
    pub fn open_buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.values()
    }

    pub fn open_bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Seed an open bucket during recovery
    pub fn restore_bucket(&mut self, bucket: Bucket) {
        self.buckets.insert(bucket.group_key.clone(), bucket);
    }

    /// Seed the window boundary during recovery
    pub fn set_next_emit_time(&mut self, boundary: i64) {
        self.next_emit_time = Some(boundary);
    }

    /// Process one record, returning the buckets closed by any window
    /// rollover it triggered, in group-key order.
    fn apply(
        &mut self,
        record: &StreamRecord,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Vec<Bucket>, SqlError> {
        let timestamp = self.driving_timestamp(record, ctx)?;
        let window_start = self.granularity.window_start(timestamp);

        let mut closed = Vec::new();
        if let Some(boundary) = self.next_emit_time {
            if timestamp >= boundary {
                closed = self.drain_open_buckets();
                self.next_emit_time = None;
            }
        }

        if !self.is_processing_executor {
            debug!(
                "dormant {} executor for '{}' passing record through",
                self.granularity, ctx.aggregation_name
            );
            return Ok(closed);
        }

        if self.next_emit_time.is_none() {
            self.next_emit_time = Some(self.granularity.next_emit_time(timestamp));
        }

        if let Some(boundary) = self.next_emit_time {
            let current_window_start = self.granularity.window_start(boundary - 1);
            if window_start < current_window_start {
                return Err(SqlError::execution_error(
                    format!(
                        "record at {} falls before the open {} window starting at {}; \
                         out-of-order input past the boundary must be filtered upstream",
                        timestamp, self.granularity, current_window_start
                    ),
                    Some(ctx.aggregation_name.to_string()),
                ));
            }
        }

        let key_generator = ctx.key_generators.get(&self.granularity).ok_or_else(|| {
            SqlError::execution_error(
                format!("no key generator for granularity {}", self.granularity),
                Some(ctx.aggregation_name.to_string()),
            )
        })?;
        let group_key = key_generator.group_key(&record.fields)?;

        let bucket = self
            .buckets
            .entry(group_key.clone())
            .or_insert_with(|| Bucket::open(self.granularity, window_start, group_key));
        if bucket.group_values.is_empty() && !ctx.group_fields.is_empty() {
            for field in ctx.group_fields {
                let value = record.fields.get(field).cloned().unwrap_or(FieldValue::Null);
                bucket.group_values.insert(field.clone(), value);
            }
        }

        // Stage onto a scratch accumulator so a failing evaluation drops the
        // record without leaving the bucket half-applied.
        let mut scratch = bucket.accumulator.clone();
        if self.is_root {
            scratch.apply(&record.fields, ctx.specs)?;
        } else {
            let contribution = BucketAccumulator::from_row(&record.fields, ctx.specs)?;
            scratch.merge(&contribution);
        }
        bucket.accumulator = scratch;

        let event_time = if self.is_root {
            Some(timestamp)
        } else {
            record
                .fields
                .get(system_columns::AGG_LAST_EVENT_TIMESTAMP)
                .and_then(|v| v.as_millis())
        };
        if let Some(ts) = event_time {
            bucket.last_event_timestamp =
                Some(bucket.last_event_timestamp.map_or(ts, |prev| prev.max(ts)));
        }

        Ok(closed)
    }

    fn driving_timestamp(
        &self,
        record: &StreamRecord,
        ctx: &ExecutionContext<'_>,
    ) -> Result<i64, SqlError> {
        if !self.is_root {
            return Ok(record.timestamp);
        }
        match ctx.external_time_field {
            None => Ok(record.timestamp),
            Some(field) => match record.fields.get(field) {
                Some(value) => value.as_millis().ok_or_else(|| {
                    SqlError::execution_error(
                        format!(
                            "external time field '{}' has non-time value: {:?}",
                            field,
                            record.fields.get(field)
                        ),
                        Some(ctx.aggregation_name.to_string()),
                    )
                }),
                None => Err(SqlError::execution_error(
                    format!("external time field '{}' not present in record", field),
                    Some(ctx.aggregation_name.to_string()),
                )),
            },
        }
    }

    fn drain_open_buckets(&mut self) -> Vec<Bucket> {
        let mut closed: Vec<Bucket> = self.buckets.drain().map(|(_, b)| b).collect();
        closed.sort_by(|a, b| a.group_key.cmp(&b.group_key));
        closed
    }

    /// Evict open buckets whose window has both elapsed and aged past the
    /// retention cutoff. The live accumulation target (the bucket whose
    /// window contains `now`) always survives.
    fn purge_stale_buckets(&mut self, cutoff: i64, now: i64) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !(bucket.window_end() < cutoff && bucket.window_end() <= now));
        before - self.buckets.len()
    }
}

/// The ordered executor ladder, finest granularity first.
pub struct ExecutorChain {
    stages: Vec<IncrementalExecutor>,
}

impl ExecutorChain {
    /// Build a chain over the maintained granularities, finest first
    pub fn new(granularities: &[TimeGranularity]) -> Self {
        let stages = granularities
            .iter()
            .enumerate()
            .map(|(index, g)| IncrementalExecutor::new(*g, index == 0))
            .collect();
        ExecutorChain { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage by position, finest first
    pub fn stage(&self, index: usize) -> Option<&IncrementalExecutor> {
        self.stages.get(index)
    }

    pub fn stage_mut(&mut self, index: usize) -> Option<&mut IncrementalExecutor> {
        self.stages.get_mut(index)
    }

    /// Position of a granularity in the ladder
    pub fn index_of(&self, granularity: TimeGranularity) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage.granularity == granularity)
    }

    /// Mark every executor live or dormant
    pub fn set_processing(&mut self, live: bool) {
        for stage in &mut self.stages {
            stage.set_processing(live);
        }
    }

    /// Feed a batch through the chain. Records failing key generation or
    /// aggregate evaluation are dropped individually; the batch continues.
    pub fn execute(&mut self, batch: &[StreamRecord], ctx: &ExecutionContext<'_>) -> ProcessResult {
        let mut result = ProcessResult::default();
        for record in batch {
            match self.execute_record(record, ctx) {
                Ok(()) => result.accepted += 1,
                Err(error) => {
                    result.failed += 1;
                    warn!(
                        "dropping record for aggregation '{}': {}",
                        ctx.aggregation_name, error
                    );
                }
            }
        }
        result
    }

    fn execute_record(
        &mut self,
        record: &StreamRecord,
        ctx: &ExecutionContext<'_>,
    ) -> Result<(), SqlError> {
        let mut pending: VecDeque<(usize, StreamRecord)> = VecDeque::new();
        pending.push_back((0, record.clone()));

        while let Some((index, record)) = pending.pop_front() {
            let closed = self.stages[index].apply(&record, ctx)?;
            for bucket in closed {
                let row = bucket.to_row(ctx.specs, ctx.external_time_field.is_some());
                // Fire-and-forget relative to the executor's own state
                // transition; persistence failures are the table's concern.
                match ctx.tables.get(&bucket.granularity) {
                    Some(table) => {
                        if let Err(error) = table.insert(row.clone()) {
                            warn!(
                                "failed to persist closed {} bucket for '{}': {}",
                                bucket.granularity, ctx.aggregation_name, error
                            );
                        }
                    }
                    None => warn!(
                        "no table registered for granularity {} of '{}'",
                        bucket.granularity, ctx.aggregation_name
                    ),
                }
                if index + 1 < self.stages.len() {
                    pending.push_back((
                        index + 1,
                        StreamRecord::new(bucket.window_start, row.values),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Evict stale open buckets at one granularity; see
    /// [`IncrementalExecutor::purge_stale_buckets`].
    pub fn purge_stale_buckets(
        &mut self,
        granularity: TimeGranularity,
        cutoff: i64,
        now: i64,
    ) -> usize {
        match self.index_of(granularity) {
            Some(index) => self.stages[index].purge_stale_buckets(cutoff, now),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tempostream::sql::execution::types::FieldType;
    use crate::tempostream::table::{InMemoryAggregateTable, TableSchema};

    fn specs() -> Vec<AggregateSpec> {
        vec![
            AggregateSpec::count("trades"),
            AggregateSpec::sum("volume_total", "volume"),
        ]
    }

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            (system_columns::AGG_TIMESTAMP.to_string(), FieldType::Integer),
            ("symbol".to_string(), FieldType::String),
            ("trades".to_string(), FieldType::Integer),
            ("volume_total".to_string(), FieldType::Integer),
        ])
    }

    struct Fixture {
        tables: HashMap<TimeGranularity, Arc<dyn AggregateTable>>,
        key_generators: HashMap<TimeGranularity, Arc<dyn GroupByKeyGenerator>>,
        specs: Vec<AggregateSpec>,
        group_fields: Vec<String>,
    }

    impl Fixture {
        fn new(granularities: &[TimeGranularity]) -> Self {
            let mut tables: HashMap<TimeGranularity, Arc<dyn AggregateTable>> = HashMap::new();
            let mut key_generators: HashMap<TimeGranularity, Arc<dyn GroupByKeyGenerator>> =
                HashMap::new();
            for g in granularities {
                tables.insert(
                    *g,
                    Arc::new(InMemoryAggregateTable::new(
                        format!("agg_{}", g),
                        schema(),
                    )),
                );
                key_generators.insert(
                    *g,
                    Arc::new(FieldGroupByKeyGenerator::new(vec!["symbol".to_string()])),
                );
            }
            Fixture {
                tables,
                key_generators,
                specs: specs(),
                group_fields: vec!["symbol".to_string()],
            }
        }

        fn ctx(&self) -> ExecutionContext<'_> {
            ExecutionContext {
                tables: &self.tables,
                key_generators: &self.key_generators,
                specs: &self.specs,
                group_fields: &self.group_fields,
                external_time_field: None,
                aggregation_name: "trade_agg",
            }
        }

        fn table(&self, granularity: TimeGranularity) -> &dyn AggregateTable {
            self.tables[&granularity].as_ref()
        }
    }

    fn event(timestamp: i64, symbol: &str, volume: i64) -> StreamRecord {
        let mut fields = HashMap::new();
        fields.insert("symbol".to_string(), FieldValue::String(symbol.into()));
        fields.insert("volume".to_string(), FieldValue::Integer(volume));
        StreamRecord::new(timestamp, fields)
    }

    #[test]
    fn rollover_closes_and_persists_buckets() {
        let fixture = Fixture::new(&[TimeGranularity::Seconds]);
        let mut chain = ExecutorChain::new(&[TimeGranularity::Seconds]);
        chain.set_processing(true);

        let result = chain.execute(
            &[event(0, "AAPL", 1), event(500, "AAPL", 2), event(1_200, "AAPL", 4)],
            &fixture.ctx(),
        );
        assert_eq!(result, ProcessResult { accepted: 3, failed: 0 });

        // Window [0, 1000) closed and persisted; window [1000, 2000) open
        assert_eq!(fixture.table(TimeGranularity::Seconds).row_count(), 1);
        let stage = chain.stage(0).unwrap();
        assert_eq!(stage.open_bucket_count(), 1);
        let open = stage.open_buckets().next().unwrap();
        assert_eq!(open.window_start, 1_000);
        assert_eq!(open.accumulator.count, 1);
    }

    #[test]
    fn keys_never_share_buckets() {
        let fixture = Fixture::new(&[TimeGranularity::Seconds]);
        let mut chain = ExecutorChain::new(&[TimeGranularity::Seconds]);
        chain.set_processing(true);

        chain.execute(
            &[event(0, "AAPL", 1), event(100, "MSFT", 2), event(200, "AAPL", 3)],
            &fixture.ctx(),
        );
        let stage = chain.stage(0).unwrap();
        assert_eq!(stage.open_bucket_count(), 2);
        let by_key: HashMap<&str, u64> = stage
            .open_buckets()
            .map(|b| (b.group_key.as_str(), b.accumulator.count))
            .collect();
        assert_eq!(by_key["AAPL"], 2);
        assert_eq!(by_key["MSFT"], 1);
    }

    #[test]
    fn completed_buckets_cascade_to_coarser_stage() {
        let granularities = [TimeGranularity::Seconds, TimeGranularity::Minutes];
        let fixture = Fixture::new(&granularities);
        let mut chain = ExecutorChain::new(&granularities);
        chain.set_processing(true);

        // Two events in second 0, one in second 1 closes the first bucket
        chain.execute(
            &[event(0, "AAPL", 1), event(500, "AAPL", 2), event(1_000, "AAPL", 4)],
            &fixture.ctx(),
        );

        let minutes = chain.stage(1).unwrap();
        assert_eq!(minutes.open_bucket_count(), 1);
        let open = minutes.open_buckets().next().unwrap();
        assert_eq!(open.accumulator.count, 2);
        assert_eq!(open.accumulator.sums["volume_total"].0, 3.0);
        assert_eq!(open.window_start, 0);
    }

    #[test]
    fn malformed_record_is_dropped_without_corrupting_buckets() {
        let fixture = Fixture::new(&[TimeGranularity::Seconds]);
        let mut chain = ExecutorChain::new(&[TimeGranularity::Seconds]);
        chain.set_processing(true);

        let mut bad_fields = HashMap::new();
        bad_fields.insert("symbol".to_string(), FieldValue::String("AAPL".into()));
        bad_fields.insert("volume".to_string(), FieldValue::String("oops".into()));
        let batch = [
            event(0, "AAPL", 1),
            StreamRecord::new(100, bad_fields),
            event(200, "AAPL", 2),
        ];
        let result = chain.execute(&batch, &fixture.ctx());
        assert_eq!(result, ProcessResult { accepted: 2, failed: 1 });

        let stage = chain.stage(0).unwrap();
        let open = stage.open_buckets().next().unwrap();
        assert_eq!(open.accumulator.count, 2);
        assert_eq!(open.accumulator.sums["volume_total"].0, 3.0);
    }

    #[test]
    fn out_of_order_past_boundary_is_rejected() {
        let fixture = Fixture::new(&[TimeGranularity::Seconds]);
        let mut chain = ExecutorChain::new(&[TimeGranularity::Seconds]);
        chain.set_processing(true);

        let result = chain.execute(
            &[event(2_000, "AAPL", 1), event(500, "AAPL", 2)],
            &fixture.ctx(),
        );
        assert_eq!(result.failed, 1);
        let open = chain.stage(0).unwrap().open_buckets().next().unwrap();
        assert_eq!(open.accumulator.count, 1);
    }

    #[test]
    fn dormant_executor_does_not_accumulate() {
        let fixture = Fixture::new(&[TimeGranularity::Seconds]);
        let mut chain = ExecutorChain::new(&[TimeGranularity::Seconds]);

        chain.execute(&[event(0, "AAPL", 1)], &fixture.ctx());
        assert_eq!(chain.stage(0).unwrap().open_bucket_count(), 0);
    }

    #[test]
    fn external_time_drives_window_assignment() {
        let fixture = Fixture::new(&[TimeGranularity::Seconds]);
        let mut chain = ExecutorChain::new(&[TimeGranularity::Seconds]);
        chain.set_processing(true);

        let mut fields = HashMap::new();
        fields.insert("symbol".to_string(), FieldValue::String("AAPL".into()));
        fields.insert("volume".to_string(), FieldValue::Integer(1));
        fields.insert("event_time".to_string(), FieldValue::Integer(5_500));
        // Arrival timestamp far from the external one
        let record = StreamRecord::new(99_000, fields);

        let ctx = ExecutionContext {
            external_time_field: Some("event_time"),
            ..fixture.ctx()
        };
        chain.execute(&[record], &ctx);
        let open = chain.stage(0).unwrap().open_buckets().next().unwrap();
        assert_eq!(open.window_start, 5_000);
        assert_eq!(open.last_event_timestamp, Some(5_500));
    }

    #[test]
    fn stale_open_buckets_purge_but_live_target_survives() {
        let fixture = Fixture::new(&[TimeGranularity::Seconds]);
        let mut chain = ExecutorChain::new(&[TimeGranularity::Seconds]);
        chain.set_processing(true);

        chain.execute(&[event(10_000, "AAPL", 1)], &fixture.ctx());
        // now = 10_500: the open window [10000, 11000) contains now
        assert_eq!(
            chain.purge_stale_buckets(TimeGranularity::Seconds, 20_000, 10_500),
            0
        );
        // Long afterwards the same bucket is stale and past retention
        assert_eq!(
            chain.purge_stale_buckets(TimeGranularity::Seconds, 20_000, 30_000),
            1
        );
    }
}
