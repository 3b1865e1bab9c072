//! Atomic counters for stack observability.
//!
//! All counters use relaxed ordering; they are diagnostic, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operation counters shared by every stack in the process.
pub struct StackMetrics {
    /// Stacks successfully constructed.
    pub constructions: AtomicU64,
    /// Successful pushes.
    pub pushes: AtomicU64,
    /// Successful pops.
    pub pops: AtomicU64,
    /// Pops that found the stack empty.
    pub empty_pops: AtomicU64,
    /// Doubling reallocations.
    pub grows: AtomicU64,
    /// Shrinking reallocations.
    pub shrinks: AtomicU64,
    /// Full verification passes run.
    pub verifications: AtomicU64,
    /// Verifications that found a violation.
    pub violations: AtomicU64,
    /// Dump records written.
    pub dumps: AtomicU64,
    /// Dumps that failed to write.
    pub dump_failures: AtomicU64,
    /// Stacks torn down after a failure.
    pub teardowns: AtomicU64,
}

impl StackMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            constructions: AtomicU64::new(0),
            pushes: AtomicU64::new(0),
            pops: AtomicU64::new(0),
            empty_pops: AtomicU64::new(0),
            grows: AtomicU64::new(0),
            shrinks: AtomicU64::new(0),
            verifications: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            dumps: AtomicU64::new(0),
            dump_failures: AtomicU64::new(0),
            teardowns: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            constructions: Self::get(&self.constructions),
            pushes: Self::get(&self.pushes),
            pops: Self::get(&self.pops),
            empty_pops: Self::get(&self.empty_pops),
            grows: Self::get(&self.grows),
            shrinks: Self::get(&self.shrinks),
            verifications: Self::get(&self.verifications),
            violations: Self::get(&self.violations),
            dumps: Self::get(&self.dumps),
            dump_failures: Self::get(&self.dump_failures),
            teardowns: Self::get(&self.teardowns),
        }
    }
}

impl Default for StackMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all stack counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub constructions: u64,
    pub pushes: u64,
    pub pops: u64,
    pub empty_pops: u64,
    pub grows: u64,
    pub shrinks: u64,
    pub verifications: u64,
    pub violations: u64,
    pub dumps: u64,
    pub dump_failures: u64,
    pub teardowns: u64,
}

static GLOBAL_METRICS: StackMetrics = StackMetrics::new();

/// Access the global metrics singleton.
#[must_use]
pub fn global_metrics() -> &'static StackMetrics {
    &GLOBAL_METRICS
}
