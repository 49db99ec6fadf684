//! End-to-end tests for the aggregation runtime: event intake through the
//! executor ladder, persisted/in-memory union on reads, recovery, purging,
//! and distributed reconciliation.

use std::collections::HashMap;
use std::sync::Arc;
use tempostream::tempostream::observability::MetricsLevel;
use tempostream::tempostream::sql::execution::types::system_columns;
use tempostream::tempostream::table::{
    AggregateTable, InMemoryAggregateTable, TableRow,
};
use tempostream::{
    AggregateSpec, AggregationConfig, AggregationQueryContext, AggregationRuntime, EventShape,
    Expr, FieldType, FieldValue, SqlError, StreamRecord, TimeGranularity, Within,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> AggregationConfig {
    AggregationConfig {
        aggregation_name: "trade_agg".to_string(),
        input_shape: EventShape::new()
            .with_attribute("symbol", FieldType::String)
            .with_attribute("volume", FieldType::Integer),
        group_by_fields: vec!["symbol".to_string()],
        aggregates: vec![
            AggregateSpec::count("trades"),
            AggregateSpec::sum("volume_total", "volume"),
        ],
        granularities: vec![TimeGranularity::Seconds, TimeGranularity::Minutes],
        retention_horizons: HashMap::new(),
        external_time_field: None,
        is_distributed: false,
        metrics_level: MetricsLevel::Basic,
        purging_interval: None,
    }
}

fn event(timestamp: i64, symbol: &str, volume: i64) -> StreamRecord {
    let mut fields = HashMap::new();
    fields.insert("symbol".to_string(), FieldValue::String(symbol.into()));
    fields.insert("volume".to_string(), FieldValue::Integer(volume));
    StreamRecord::new(timestamp, fields)
}

fn query_at(reference_time: i64) -> AggregationQueryContext {
    AggregationQueryContext {
        query_name: "test_query".to_string(),
        reference_time: Some(reference_time),
    }
}

fn find_per(
    runtime: &AggregationRuntime,
    per: &str,
    start: i64,
    now: i64,
) -> Vec<StreamRecord> {
    let compiled = runtime
        .compile_expression(
            &Expr::boolean(true),
            Some(&Within::starting_at(Expr::integer(start))),
            Some(&Expr::string(per)),
            &EventShape::new(),
        )
        .unwrap();
    runtime
        .find(&compiled, &StreamRecord::new(now, HashMap::new()), &query_at(now))
        .unwrap()
}

fn count_of(record: &StreamRecord) -> i64 {
    match record.fields.get("trades") {
        Some(FieldValue::Integer(i)) => *i,
        other => panic!("missing trades count: {:?}", other),
    }
}

#[test]
fn sixty_five_events_split_across_the_ladder() {
    init_logging();
    let runtime = AggregationRuntime::with_in_memory_tables(config()).unwrap();
    let batch: Vec<StreamRecord> = (0..65).map(|i| event(i * 1_000, "AAPL", 1)).collect();
    let result = runtime.process_events(&batch).unwrap();
    assert_eq!(result.accepted, 65);
    assert_eq!(result.failed, 0);

    // 64 closed seconds buckets persisted; the first full minute persisted
    let stats = runtime.stats().unwrap();
    assert_eq!(stats.persisted_rows[0], (TimeGranularity::Seconds, 64));
    assert_eq!(stats.persisted_rows[1], (TimeGranularity::Minutes, 1));
    // One open bucket at each level
    assert_eq!(stats.open_buckets[0], (TimeGranularity::Seconds, 1));
    assert_eq!(stats.open_buckets[1], (TimeGranularity::Minutes, 1));
}

#[test]
fn per_minutes_read_unites_closed_rows_with_open_buckets() {
    init_logging();
    let runtime = AggregationRuntime::with_in_memory_tables(config()).unwrap();
    let batch: Vec<StreamRecord> = (0..65).map(|i| event(i * 1_000, "AAPL", 1)).collect();
    runtime.process_events(&batch).unwrap();

    let mut rows = find_per(&runtime, "minutes", 0, 65_500);
    rows.sort_by_key(|r| r.timestamp);
    assert_eq!(rows.len(), 2);
    // Closed minute [0, 60s) holds 60 events
    assert_eq!(rows[0].timestamp, 0);
    assert_eq!(count_of(&rows[0]), 60);
    // The partial minute combines the open minute bucket (seconds 60..63)
    // with the still-open seconds bucket (second 64)
    assert_eq!(rows[1].timestamp, 60_000);
    assert_eq!(count_of(&rows[1]), 5);
    // Count conservation across the ladder
    assert_eq!(rows.iter().map(count_of).sum::<i64>(), 65);
}

#[test]
fn per_seconds_read_includes_the_open_second() {
    init_logging();
    let runtime = AggregationRuntime::with_in_memory_tables(config()).unwrap();
    let batch: Vec<StreamRecord> = (0..65).map(|i| event(i * 1_000, "AAPL", 1)).collect();
    runtime.process_events(&batch).unwrap();

    let rows = find_per(&runtime, "seconds", 0, 65_500);
    assert_eq!(rows.len(), 65);
    assert!(rows.iter().all(|r| count_of(r) == 1));
}

#[test]
fn within_range_filters_by_bucket_start() {
    init_logging();
    let runtime = AggregationRuntime::with_in_memory_tables(config()).unwrap();
    let batch: Vec<StreamRecord> = (0..10).map(|i| event(i * 1_000, "AAPL", 1)).collect();
    runtime.process_events(&batch).unwrap();

    let compiled = runtime
        .compile_expression(
            &Expr::boolean(true),
            Some(&Within::range(Expr::integer(3_000), Expr::integer(6_000))),
            Some(&Expr::string("seconds")),
            &EventShape::new(),
        )
        .unwrap();
    let mut rows = runtime
        .find(
            &compiled,
            &StreamRecord::new(10_000, HashMap::new()),
            &query_at(10_000),
        )
        .unwrap();
    rows.sort_by_key(|r| r.timestamp);
    let starts: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
    assert_eq!(starts, vec![3_000, 4_000, 5_000]);
}

#[test]
fn on_condition_filters_groups() {
    init_logging();
    let runtime = AggregationRuntime::with_in_memory_tables(config()).unwrap();
    runtime
        .process_events(&[
            event(0, "AAPL", 1),
            event(100, "MSFT", 2),
            event(200, "AAPL", 3),
        ])
        .unwrap();

    let on = Expr::compare(
        Expr::column("symbol"),
        tempostream::tempostream::sql::ast::BinaryOperator::Equal,
        Expr::string("AAPL"),
    );
    let compiled = runtime
        .compile_expression(
            &on,
            Some(&Within::starting_at(Expr::integer(0))),
            Some(&Expr::string("seconds")),
            &EventShape::new(),
        )
        .unwrap();
    let rows = runtime
        .find(&compiled, &StreamRecord::new(0, HashMap::new()), &query_at(5_000))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(count_of(&rows[0]), 2);
    assert_eq!(
        rows[0].fields["symbol"],
        FieldValue::String("AAPL".to_string())
    );
}

#[test]
fn averages_survive_the_rollup() {
    init_logging();
    let mut cfg = config();
    cfg.input_shape.set_attribute("price", FieldType::Float);
    cfg.aggregates.push(AggregateSpec::avg("avg_price", "price"));
    let runtime = AggregationRuntime::with_in_memory_tables(cfg).unwrap();

    let mut batch = Vec::new();
    for (i, price) in [10.0_f64, 20.0, 30.0, 40.0].iter().enumerate() {
        let mut record = event(i as i64 * 1_000, "AAPL", 1);
        record
            .fields
            .insert("price".to_string(), FieldValue::Float(*price));
        batch.push(record);
    }
    runtime.process_events(&batch).unwrap();

    // All four prices fold into one partial minute
    let rows = find_per(&runtime, "minutes", 0, 4_500);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].fields["avg_price"], FieldValue::Float(25.0));
    // The split sum/count columns never reach the caller
    assert!(!rows[0].fields.contains_key("avg_price_SUM"));
}

#[test]
fn compile_errors_are_deterministic() {
    init_logging();
    let runtime = AggregationRuntime::with_in_memory_tables(config()).unwrap();
    let shape = EventShape::new();

    let missing_per = runtime
        .compile_expression(
            &Expr::boolean(true),
            Some(&Within::starting_at(Expr::integer(0))),
            None,
            &shape,
        )
        .unwrap_err();
    assert!(matches!(missing_per, SqlError::ParseError { .. }));
    assert!(missing_per.to_string().contains("per"));

    let missing_within = runtime
        .compile_expression(&Expr::boolean(true), None, Some(&Expr::string("seconds")), &shape)
        .unwrap_err();
    assert!(missing_within.to_string().contains("within"));

    let bad_granularity = || {
        runtime
            .compile_expression(
                &Expr::boolean(true),
                Some(&Within::starting_at(Expr::integer(0))),
                Some(&Expr::string("fortnights")),
                &shape,
            )
            .unwrap_err()
    };
    assert_eq!(bad_granularity(), bad_granularity());

    let non_string_per = runtime
        .compile_expression(
            &Expr::boolean(true),
            Some(&Within::starting_at(Expr::integer(0))),
            Some(&Expr::integer(5)),
            &shape,
        )
        .unwrap_err();
    assert!(matches!(non_string_per, SqlError::TypeError { .. }));
}

#[test]
fn unmaintained_per_granularity_is_rejected_at_read_time() {
    init_logging();
    let runtime = AggregationRuntime::with_in_memory_tables(config()).unwrap();
    runtime.process_events(&[event(0, "AAPL", 1)]).unwrap();

    let compiled = runtime
        .compile_expression(
            &Expr::boolean(true),
            Some(&Within::starting_at(Expr::integer(0))),
            Some(&Expr::string("years")),
            &EventShape::new(),
        )
        .unwrap();
    let error = runtime
        .find(&compiled, &StreamRecord::new(0, HashMap::new()), &query_at(5_000))
        .unwrap_err();
    assert!(matches!(error, SqlError::ExecutionError { .. }));
}

#[test]
fn purge_deletes_aged_rows_and_is_idempotent() {
    init_logging();
    let mut cfg = config();
    cfg.retention_horizons
        .insert(TimeGranularity::Seconds, 10_000);
    let runtime = AggregationRuntime::with_in_memory_tables(cfg).unwrap();
    let batch: Vec<StreamRecord> = (0..65).map(|i| event(i * 1_000, "AAPL", 1)).collect();
    runtime.process_events(&batch).unwrap();

    // cutoff 55_500: windows ending up to 55s go, windows 55..63 stay
    let summary = runtime.run_purge_at(65_500).unwrap();
    assert!(summary.is_complete());
    assert_eq!(summary.rows_deleted(), 55);
    let stats = runtime.stats().unwrap();
    assert_eq!(stats.persisted_rows[0], (TimeGranularity::Seconds, 9));
    // The minutes table has no horizon configured and is untouched
    assert_eq!(stats.persisted_rows[1], (TimeGranularity::Minutes, 1));

    let again = runtime.run_purge_at(65_500).unwrap();
    assert_eq!(again.rows_deleted(), 0);
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

fn shared_tables(
    cfg: &AggregationConfig,
) -> HashMap<TimeGranularity, Arc<dyn AggregateTable>> {
    let schema = tempostream::tempostream::sql::execution::aggregation::runtime::build_table_schema(
        cfg,
    )
    .unwrap();
    let mut tables: HashMap<TimeGranularity, Arc<dyn AggregateTable>> = HashMap::new();
    for g in cfg.granularities.iter().copied() {
        tables.insert(
            g,
            Arc::new(InMemoryAggregateTable::new(
                format!("{}_{}", cfg.aggregation_name, g),
                schema.clone(),
            )),
        );
    }
    tables
}

#[test]
fn read_before_first_event_recovers_open_buckets() {
    init_logging();
    let cfg = config();
    let tables = shared_tables(&cfg);
    // Rows persisted by the previous process for the still-open minute
    let seconds = &tables[&TimeGranularity::Seconds];
    seconds.insert(seconds_row(60_000, "AAPL", 1, 10)).unwrap();
    seconds.insert(seconds_row(61_000, "AAPL", 1, 20)).unwrap();

    let runtime = AggregationRuntime::new(cfg, tables).unwrap();
    let rows = find_per(&runtime, "minutes", 0, 90_000);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].timestamp, 60_000);
    assert_eq!(count_of(&rows[0]), 2);
    assert_eq!(rows[0].fields["volume_total"], FieldValue::Integer(30));
}

#[test]
fn processing_after_recovery_extends_the_restored_minute() {
    init_logging();
    let cfg = config();
    let tables = shared_tables(&cfg);
    let seconds = Arc::clone(&tables[&TimeGranularity::Seconds]);
    seconds.insert(seconds_row(60_000, "AAPL", 1, 10)).unwrap();
    seconds.insert(seconds_row(61_000, "AAPL", 1, 20)).unwrap();

    let runtime = AggregationRuntime::new(cfg, tables).unwrap();
    // First batch triggers recovery, then the events extend minute [60s, 120s)
    runtime
        .process_events(&[event(62_000, "AAPL", 5), event(120_000, "AAPL", 1)])
        .unwrap();
    // Crossing into the next minute closes and persists the restored one
    runtime.process_events(&[event(121_000, "AAPL", 1)]).unwrap();

    let minutes = runtime.table(TimeGranularity::Minutes).unwrap();
    assert_eq!(minutes.row_count(), 1);
    let rows = find_per(&runtime, "minutes", 60_000, 121_500);
    let closed = rows.iter().find(|r| r.timestamp == 60_000).unwrap();
    assert_eq!(count_of(closed), 3);
    assert_eq!(closed.fields["volume_total"], FieldValue::Integer(35));
}

#[test]
fn distributed_read_reconciles_remote_rows_without_double_counting() {
    init_logging();
    let mut cfg = config();
    cfg.is_distributed = true;
    let tables = shared_tables(&cfg);
    let seconds = Arc::clone(&tables[&TimeGranularity::Seconds]);

    let runtime = AggregationRuntime::new(cfg, tables).unwrap();
    // Local events: seconds 60 and 61 close and persist, second 62 stays open
    runtime
        .process_events(&[
            event(60_000, "AAPL", 1),
            event(61_000, "AAPL", 1),
            event(62_500, "AAPL", 1),
        ])
        .unwrap();
    // Another node's row for the same minute arrives through the shared table
    seconds.insert(seconds_row(63_000, "AAPL", 2, 7)).unwrap();

    let compiled = runtime
        .compile_expression(
            &Expr::boolean(true),
            Some(&Within::starting_at(Expr::integer(0))),
            Some(&Expr::string("minutes")),
            &EventShape::new(),
        )
        .unwrap();
    // One boundary filter guards the seconds/minutes seam
    assert_eq!(compiled.boundary_filter_count(), 1);

    let rows = runtime
        .find(&compiled, &StreamRecord::new(0, HashMap::new()), &query_at(65_000))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].timestamp, 60_000);
    // Locally closed seconds come from the table, the open second from
    // memory, the remote row from the boundary-filtered scan: each once.
    assert_eq!(count_of(&rows[0]), 5);
}

#[test]
fn distributed_read_spans_three_levels_without_gaps() {
    init_logging();
    let mut cfg = config();
    cfg.granularities = vec![
        TimeGranularity::Seconds,
        TimeGranularity::Minutes,
        TimeGranularity::Hours,
    ];
    cfg.is_distributed = true;
    let tables = shared_tables(&cfg);
    let seconds = Arc::clone(&tables[&TimeGranularity::Seconds]);

    let runtime = AggregationRuntime::new(cfg, tables).unwrap();
    // Local events across minutes 60..62 of the first hour. Second 3661
    // closes into the minute-61 bucket, which stays open in memory because
    // no later second has rolled it over yet.
    runtime
        .process_events(&[
            event(3_600_500, "AAPL", 1),
            event(3_661_000, "AAPL", 1),
            event(3_662_000, "AAPL", 1),
            event(3_725_000, "AAPL", 1),
        ])
        .unwrap();
    // Another node's row inside the current minute
    seconds.insert(seconds_row(3_721_000, "AAPL", 2, 7)).unwrap();

    let rows = find_per(&runtime, "hours", 0, 3_726_000);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].timestamp, 3_600_000);
    // Minute 60 from the minutes table, seconds 3661/3662 from the open
    // minute-61 bucket, second 3725 from the open base bucket, the remote
    // row from the boundary-filtered scan: six events, each exactly once.
    assert_eq!(count_of(&rows[0]), 6);
}

#[test]
fn external_time_read_filters_on_the_event_axis() {
    init_logging();
    let mut cfg = config();
    cfg.input_shape.set_attribute("event_time", FieldType::Integer);
    cfg.external_time_field = Some("event_time".to_string());
    let runtime = AggregationRuntime::with_in_memory_tables(cfg).unwrap();

    // Arrival timestamps are far from the event-time field; bucketing and
    // range filtering must follow the latter.
    let mut batch = Vec::new();
    for (arrival, event_time) in [(990_000, 1_000), (991_000, 1_500), (992_000, 2_200)] {
        let mut record = event(arrival, "AAPL", 1);
        record
            .fields
            .insert("event_time".to_string(), FieldValue::Integer(event_time));
        batch.push(record);
    }
    runtime.process_events(&batch).unwrap();

    let compiled = runtime
        .compile_expression(
            &Expr::boolean(true),
            Some(&Within::range(Expr::integer(1_000), Expr::integer(2_000))),
            Some(&Expr::string("seconds")),
            &EventShape::new(),
        )
        .unwrap();
    let rows = runtime
        .find(&compiled, &StreamRecord::new(0, HashMap::new()), &query_at(5_000))
        .unwrap();
    // Only the closed second [1000, 2000) falls in range; the open second
    // at 2000 is excluded even though every arrival was in the 990s range
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].timestamp, 1_000);
    assert_eq!(count_of(&rows[0]), 2);
    assert_eq!(
        rows[0].fields[system_columns::AGG_EVENT_TIMESTAMP],
        FieldValue::Integer(1_000)
    );
}

#[test]
fn stats_track_reads_when_metrics_are_on() {
    init_logging();
    let runtime = AggregationRuntime::with_in_memory_tables(config()).unwrap();
    runtime.process_events(&[event(0, "AAPL", 1)]).unwrap();
    find_per(&runtime, "seconds", 0, 5_000);
    find_per(&runtime, "seconds", 0, 5_000);

    let stats = runtime.stats().unwrap();
    assert_eq!(stats.events_observed, 1);
    assert_eq!(stats.find_invocations, 2);
}
