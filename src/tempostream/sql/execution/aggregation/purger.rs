//! Retention purging of aged-out aggregate data.
//!
//! Each granularity carries its own retention horizon. A purge pass deletes
//! the persisted rows whose window ended before `now - retention` and evicts
//! the matching stale open buckets, one granularity at a time. Granularities
//! are independent: a failing table delete is recorded in the summary and
//! the pass moves on. Re-running a pass deletes nothing new, so the purge
//! scheduler needs no coordination with the write path.

use crate::tempostream::sql::execution::aggregation::executor::ExecutorChain;
use crate::tempostream::sql::execution::aggregation::granularity::TimeGranularity;
use crate::tempostream::table::AggregateTable;
use log::{error, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default interval between purge passes
pub const DEFAULT_PURGING_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Result of purging one granularity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeOutcome {
    Purged {
        rows_deleted: usize,
        buckets_evicted: usize,
    },
    Failed {
        message: String,
    },
}

/// Per-granularity outcomes of one purge pass
#[derive(Debug, Clone, Default)]
pub struct PurgeSummary {
    pub outcomes: Vec<(TimeGranularity, PurgeOutcome)>,
}

impl PurgeSummary {
    /// Total persisted rows deleted across granularities
    pub fn rows_deleted(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, outcome)| match outcome {
                PurgeOutcome::Purged { rows_deleted, .. } => *rows_deleted,
                PurgeOutcome::Failed { .. } => 0,
            })
            .sum()
    }

    /// Whether every granularity purged cleanly
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| matches!(outcome, PurgeOutcome::Purged { .. }))
    }
}

/// Deletes aggregate data older than the configured retention horizons
pub struct IncrementalDataPurger {
    /// Retention per granularity, in milliseconds
    retention_horizons: HashMap<TimeGranularity, i64>,
    purging_interval: Duration,
    aggregation_name: String,
}

impl IncrementalDataPurger {
    pub fn new(
        aggregation_name: impl Into<String>,
        retention_horizons: HashMap<TimeGranularity, i64>,
        purging_interval: Option<Duration>,
    ) -> Self {
        IncrementalDataPurger {
            retention_horizons,
            purging_interval: purging_interval.unwrap_or(DEFAULT_PURGING_INTERVAL),
            aggregation_name: aggregation_name.into(),
        }
    }

    /// Interval the embedding engine should schedule purge passes at
    pub fn purging_interval(&self) -> Duration {
        self.purging_interval
    }

    /// Retention horizon for one granularity, when configured
    pub fn retention_for(&self, granularity: TimeGranularity) -> Option<i64> {
        self.retention_horizons.get(&granularity).copied()
    }

    /// Run one purge pass over every granularity with a retention horizon.
    pub fn execute(
        &self,
        chain: &mut ExecutorChain,
        tables: &HashMap<TimeGranularity, Arc<dyn AggregateTable>>,
        now: i64,
    ) -> PurgeSummary {
        let mut summary = PurgeSummary::default();
        let mut horizons: Vec<(TimeGranularity, i64)> = self
            .retention_horizons
            .iter()
            .map(|(g, retention)| (*g, *retention))
            .collect();
        horizons.sort_by_key(|(g, _)| *g);

        for (granularity, retention) in horizons {
            let cutoff = now.saturating_sub(retention);
            let outcome = match tables.get(&granularity) {
                Some(table) => self.purge_granularity(chain, table, granularity, cutoff, now),
                None => PurgeOutcome::Failed {
                    message: format!("no table registered for granularity {}", granularity),
                },
            };
            match &outcome {
                PurgeOutcome::Purged {
                    rows_deleted,
                    buckets_evicted,
                } if *rows_deleted > 0 || *buckets_evicted > 0 => {
                    info!(
                        "aggregation '{}': purged {} {} row(s) and {} stale bucket(s) \
                         older than {}",
                        self.aggregation_name, rows_deleted, granularity, buckets_evicted, cutoff
                    );
                }
                PurgeOutcome::Failed { message } => {
                    error!(
                        "aggregation '{}': purging {} failed: {}",
                        self.aggregation_name, granularity, message
                    );
                }
                _ => {}
            }
            summary.outcomes.push((granularity, outcome));
        }
        summary
    }

    fn purge_granularity(
        &self,
        chain: &mut ExecutorChain,
        table: &Arc<dyn AggregateTable>,
        granularity: TimeGranularity,
        cutoff: i64,
        now: i64,
    ) -> PurgeOutcome {
        let rows_deleted =
            match table.delete_where(&|row| granularity.window_end(row.window_start) < cutoff) {
                Ok(deleted) => deleted,
                Err(error) => {
                    return PurgeOutcome::Failed {
                        message: error.to_string(),
                    };
                }
            };
        let buckets_evicted = chain.purge_stale_buckets(granularity, cutoff, now);
        PurgeOutcome::Purged {
            rows_deleted,
            buckets_evicted,
        }
    }
}
