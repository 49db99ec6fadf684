//! One-shot reconstruction of in-memory executor state from persisted rows.
//!
//! After a restart the tables hold every closed bucket but the executors are
//! empty: the coarser stages have lost the partial windows that were open
//! when the process died. Before the first event (or the first read) is
//! served, each stage above the base rebuilds its open buckets by merging
//! the finer table's rows that fall inside its current window, then the
//! whole chain is marked live. The latch guarantees this runs exactly once
//! even when events and reads race for it.

use crate::tempostream::sql::error::SqlError;
use crate::tempostream::sql::execution::aggregation::accumulator::{
    AggregateSpec, BucketAccumulator,
};
use crate::tempostream::sql::execution::aggregation::executor::{
    Bucket, ExecutorChain, GroupByKeyGenerator,
};
use crate::tempostream::sql::execution::aggregation::granularity::TimeGranularity;
use crate::tempostream::sql::execution::types::{system_columns, FieldType, FieldValue};
use crate::tempostream::sql::ast::{BinaryOperator, Expr};
use crate::tempostream::sql::execution::expression::EventShape;
use crate::tempostream::table::AggregateTable;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Collaborators the initialiser reads from
pub struct RecoveryContext<'a> {
    pub tables: &'a HashMap<TimeGranularity, Arc<dyn AggregateTable>>,
    pub key_generators: &'a HashMap<TimeGranularity, Arc<dyn GroupByKeyGenerator>>,
    pub specs: &'a [AggregateSpec],
    pub group_fields: &'a [String],
    pub aggregation_name: &'a str,
}

/// Rebuilds executor state once per process lifetime
pub struct IncrementalExecutorsInitialiser {
    initialised: AtomicBool,
}

impl Default for IncrementalExecutorsInitialiser {
    fn default() -> Self {
        IncrementalExecutorsInitialiser::new()
    }
}

impl IncrementalExecutorsInitialiser {
    pub fn new() -> Self {
        IncrementalExecutorsInitialiser {
            initialised: AtomicBool::new(false),
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }

    /// Recover the chain's open buckets and mark it live. Only the first
    /// caller performs the work; a table read failure releases the latch so
    /// a later caller can retry.
    pub fn initialise(
        &self,
        chain: &mut ExecutorChain,
        ctx: &RecoveryContext<'_>,
        now: i64,
    ) -> Result<(), SqlError> {
        if self
            .initialised
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        if let Err(error) = self.recover(chain, ctx, now) {
            self.initialised.store(false, Ordering::Release);
            return Err(error);
        }
        chain.set_processing(true);
        info!(
            "aggregation '{}' executors initialised and live",
            ctx.aggregation_name
        );
        Ok(())
    }

    fn recover(
        &self,
        chain: &mut ExecutorChain,
        ctx: &RecoveryContext<'_>,
        now: i64,
    ) -> Result<(), SqlError> {
        // Stage 0 has no finer level to recover from; anything it lost was
        // never persisted anywhere.
        for index in 1..chain.len() {
            let (granularity, finer) = match (chain.stage(index), chain.stage(index - 1)) {
                (Some(stage), Some(finer)) => (stage.granularity(), finer.granularity()),
                _ => continue,
            };
            let window_start = granularity.window_start(now);
            let rows = self.read_window_rows(ctx, finer, window_start)?;
            if rows.is_empty() {
                continue;
            }

            let key_generator = ctx.key_generators.get(&granularity).ok_or_else(|| {
                SqlError::recovery_error(
                    format!("no key generator for granularity {}", granularity),
                    Some(granularity.to_string()),
                )
            })?;

            let mut buckets: HashMap<String, Bucket> = HashMap::new();
            for row in &rows {
                let group_key = key_generator.group_key(&row.values)?;
                let contribution = BucketAccumulator::from_row(&row.values, ctx.specs)?;
                let bucket = buckets.entry(group_key.clone()).or_insert_with(|| Bucket {
                    group_key,
                    granularity,
                    window_start,
                    group_values: ctx
                        .group_fields
                        .iter()
                        .map(|field| {
                            (
                                field.clone(),
                                row.values.get(field).cloned().unwrap_or(FieldValue::Null),
                            )
                        })
                        .collect(),
                    last_event_timestamp: row
                        .values
                        .get(system_columns::AGG_LAST_EVENT_TIMESTAMP)
                        .and_then(|v| v.as_millis()),
                    accumulator: BucketAccumulator::new(),
                });
                bucket.accumulator.merge(&contribution);
                if let Some(ts) = row
                    .values
                    .get(system_columns::AGG_LAST_EVENT_TIMESTAMP)
                    .and_then(|v| v.as_millis())
                {
                    bucket.last_event_timestamp =
                        Some(bucket.last_event_timestamp.map_or(ts, |prev| prev.max(ts)));
                }
            }

            debug!(
                "aggregation '{}': restored {} open {} bucket(s) from {} {} row(s)",
                ctx.aggregation_name,
                buckets.len(),
                granularity,
                rows.len(),
                finer
            );
            if let Some(stage) = chain.stage_mut(index) {
                for bucket in buckets.into_values() {
                    stage.restore_bucket(bucket);
                }
                stage.set_next_emit_time(granularity.window_end(window_start));
            }
        }
        Ok(())
    }

    /// Rows of the finer table whose bucket start falls inside the coarser
    /// window currently open.
    fn read_window_rows(
        &self,
        ctx: &RecoveryContext<'_>,
        finer: TimeGranularity,
        window_start: i64,
    ) -> Result<Vec<crate::tempostream::table::TableRow>, SqlError> {
        let table = ctx.tables.get(&finer).ok_or_else(|| {
            SqlError::recovery_error(
                format!("no table registered for granularity {}", finer),
                Some(finer.to_string()),
            )
        })?;

        let predicate = Expr::compare(
            Expr::column(system_columns::AGG_TIMESTAMP),
            BinaryOperator::GreaterThanOrEqual,
            Expr::column(system_columns::WITHIN_START),
        );
        let lookup_shape =
            EventShape::new().with_attribute(system_columns::WITHIN_START, FieldType::Integer);
        let condition = table.compile_condition(&predicate, &lookup_shape)?;

        let mut parameters = HashMap::new();
        parameters.insert(
            system_columns::WITHIN_START.to_string(),
            FieldValue::Integer(window_start),
        );
        table.find(&condition, &parameters).map_err(|error| {
            SqlError::recovery_error(
                format!(
                    "reading {} rows for recovery of aggregation '{}' failed: {}",
                    finer, ctx.aggregation_name, error
                ),
                Some(finer.to_string()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tempostream::sql::execution::aggregation::executor::FieldGroupByKeyGenerator;
    use crate::tempostream::table::{InMemoryAggregateTable, TableRow, TableSchema};

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

    fn seconds_row(window_start: i64, symbol: &str, trades: i64, volume: i64) -> TableRow {
        let mut values = HashMap::new();
        values.insert(
            system_columns::AGG_TIMESTAMP.to_string(),
            FieldValue::Integer(window_start),
        );
        values.insert("symbol".to_string(), FieldValue::String(symbol.into()));
        values.insert("trades".to_string(), FieldValue::Integer(trades));
        values.insert("volume_total".to_string(), FieldValue::Integer(volume));
        TableRow {
            group_key: symbol.to_string(),
            window_start,
            values,
        }
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
                    Arc::new(InMemoryAggregateTable::new(format!("agg_{}", g), schema())),
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

        fn ctx(&self) -> RecoveryContext<'_> {
            RecoveryContext {
                tables: &self.tables,
                key_generators: &self.key_generators,
                specs: &self.specs,
                group_fields: &self.group_fields,
                aggregation_name: "trade_agg",
            }
        }
    }

    #[test]
    fn rebuilds_open_minute_bucket_from_seconds_rows() {
        let granularities = [TimeGranularity::Seconds, TimeGranularity::Minutes];
        let fixture = Fixture::new(&granularities);
        // Two closed seconds buckets inside the current minute, one before it
        let seconds = &fixture.tables[&TimeGranularity::Seconds];
        seconds.insert(seconds_row(59_000, "AAPL", 4, 40)).unwrap();
        seconds.insert(seconds_row(60_000, "AAPL", 2, 20)).unwrap();
        seconds.insert(seconds_row(61_000, "AAPL", 3, 30)).unwrap();

        let mut chain = ExecutorChain::new(&granularities);
        let initialiser = IncrementalExecutorsInitialiser::new();
        initialiser
            .initialise(&mut chain, &fixture.ctx(), 90_000)
            .unwrap();

        let minutes = chain.stage(1).unwrap();
        assert!(minutes.is_processing());
        assert_eq!(minutes.open_bucket_count(), 1);
        let bucket = minutes.open_buckets().next().unwrap();
        assert_eq!(bucket.window_start, 60_000);
        assert_eq!(bucket.accumulator.count, 5);
        assert_eq!(bucket.accumulator.sums["volume_total"].0, 50.0);
        assert_eq!(
            bucket.group_values["symbol"],
            FieldValue::String("AAPL".into())
        );
    }

    #[test]
    fn initialise_runs_once() {
        let granularities = [TimeGranularity::Seconds, TimeGranularity::Minutes];
        let fixture = Fixture::new(&granularities);
        let seconds = &fixture.tables[&TimeGranularity::Seconds];
        seconds.insert(seconds_row(60_000, "AAPL", 1, 10)).unwrap();

        let mut chain = ExecutorChain::new(&granularities);
        let initialiser = IncrementalExecutorsInitialiser::new();
        initialiser
            .initialise(&mut chain, &fixture.ctx(), 90_000)
            .unwrap();
        // New rows after the first pass do not re-seed the chain
        seconds.insert(seconds_row(61_000, "AAPL", 9, 90)).unwrap();
        initialiser
            .initialise(&mut chain, &fixture.ctx(), 90_000)
            .unwrap();

        let bucket = chain.stage(1).unwrap().open_buckets().next().unwrap();
        assert_eq!(bucket.accumulator.count, 1);
    }

    #[test]
    fn empty_tables_still_mark_chain_live() {
        let granularities = [TimeGranularity::Seconds, TimeGranularity::Minutes];
        let fixture = Fixture::new(&granularities);
        let mut chain = ExecutorChain::new(&granularities);
        let initialiser = IncrementalExecutorsInitialiser::new();
        initialiser
            .initialise(&mut chain, &fixture.ctx(), 0)
            .unwrap();
        assert!(chain.stage(0).unwrap().is_processing());
        assert_eq!(chain.stage(1).unwrap().open_bucket_count(), 0);
    }
}
