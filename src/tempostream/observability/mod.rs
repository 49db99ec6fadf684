//! In-process latency and throughput counters for the retrieval path.
//!
//! Trackers bracket `find` calls when the configured metrics level is at
//! least [`MetricsLevel::Basic`]. They are plain atomics: exporting them is
//! the embedding engine's concern.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Minimum reporting level gating the trackers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum MetricsLevel {
    #[default]
    Off,
    Basic,
    Detail,
}

/// Wall-clock latency tracker with atomic running totals
#[derive(Debug, Default)]
pub struct LatencyTracker {
    invocations: AtomicU64,
    total_nanos: AtomicU64,
}

impl LatencyTracker {
    pub fn new() -> Self {
        LatencyTracker::default()
    }

    /// Start a latency span; the measurement records when the span drops
    pub fn track(&self) -> LatencySpan<'_> {
        LatencySpan {
            tracker: self,
            started: Instant::now(),
        }
    }

    /// Completed invocations so far
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Total measured nanoseconds across all invocations
    pub fn total_nanos(&self) -> u64 {
        self.total_nanos.load(Ordering::Relaxed)
    }

    fn record(&self, nanos: u64) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

/// RAII latency measurement
pub struct LatencySpan<'a> {
    tracker: &'a LatencyTracker,
    started: Instant,
}

impl Drop for LatencySpan<'_> {
    fn drop(&mut self) {
        let nanos = self.started.elapsed().as_nanos() as u64;
        self.tracker.record(nanos);
    }
}

/// Event counter for throughput reporting
#[derive(Debug, Default)]
pub struct ThroughputTracker {
    events: AtomicU64,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        ThroughputTracker::default()
    }

    /// Record arriving events
    pub fn events_in(&self, count: u64) {
        self.events.fetch_add(count, Ordering::Relaxed);
    }

    /// Events recorded so far
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}
