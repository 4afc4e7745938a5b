//! # Runtime Statistics
//!
//! Monotonic counters updated on the hot path with relaxed atomics, and a
//! [`RuntimeStats`] snapshot for reporting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A named monotonic counter.
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a counter starting at zero.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Add one.
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("name", &self.name)
            .field("value", &self.get())
            .finish()
    }
}

/// Counters owned by a running runtime.
#[derive(Debug)]
pub(crate) struct RuntimeCounters {
    pub(crate) jobs_executed: Counter,
    pub(crate) fibers_materialized: Counter,
    pub(crate) fiber_suspensions: Counter,
    pub(crate) panicked_jobs: Counter,
    last_panic: Mutex<Option<String>>,
}

impl RuntimeCounters {
    pub(crate) fn new() -> Self {
        Self {
            jobs_executed: Counter::new("jobs_executed"),
            fibers_materialized: Counter::new("fibers_materialized"),
            fiber_suspensions: Counter::new("fiber_suspensions"),
            panicked_jobs: Counter::new("panicked_jobs"),
            last_panic: Mutex::new(None),
        }
    }

    pub(crate) fn record_panic(&self, message: String) {
        self.panicked_jobs.inc();
        *self.last_panic.lock() = Some(message);
    }

    pub(crate) fn last_panic(&self) -> Option<String> {
        self.last_panic.lock().clone()
    }
}

/// Point-in-time view of runtime activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Jobs run to completion (panicked ones included).
    pub jobs_executed: u64,
    /// Times a fiber was bound to a fresh job from the queue.
    pub fibers_materialized: u64,
    /// Times a fiber suspended waiting on a chain.
    pub fiber_suspensions: u64,
    /// Jobs that panicked.
    pub panicked_jobs: u64,
    /// Message of the most recent job panic.
    pub last_panic: Option<String>,
    /// Bytes of the reservation currently committed.
    pub committed_bytes: usize,
    /// Bytes reserved for the arena.
    pub reserved_bytes: usize,
    /// Allocation descriptors in use.
    pub live_descriptors: usize,
    /// Dynamic tagged heaps bound to a tag.
    pub bound_heaps: usize,
}

impl fmt::Display for RuntimeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "jobs executed:       {}", self.jobs_executed)?;
        writeln!(f, "fibers materialized: {}", self.fibers_materialized)?;
        writeln!(f, "fiber suspensions:   {}", self.fiber_suspensions)?;
        writeln!(f, "panicked jobs:       {}", self.panicked_jobs)?;
        writeln!(
            f,
            "committed:           {} / {} MiB",
            self.committed_bytes >> 20,
            self.reserved_bytes >> 20
        )?;
        writeln!(f, "live descriptors:    {}", self.live_descriptors)?;
        write!(f, "bound heaps:         {}", self.bound_heaps)
    }
}
