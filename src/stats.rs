//! Scheduler statistics
//!
//! Per-runqueue counters for the deadline class. Everything here is
//! observable only; no scheduling decision may read it back.

use core::sync::atomic::{AtomicU64, Ordering};

/// Virtual cycle counter feeding the `*_cycles` fields: a monotonic
/// sequence usable for relative cost accounting on any target.
static CYCLES: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn get_cycles() -> u64 {
    CYCLES.fetch_add(1, Ordering::Relaxed)
}

/// Per-runqueue deadline-class counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DlRqStats {
    pub nr_enqueue: u64,
    pub nr_dequeue: u64,
    pub nr_push: u64,
    pub nr_retry_push: u64,
    pub nr_pushed_away: u64,
    pub nr_pull: u64,
    pub nr_pulled_here: u64,
    pub enqueue_cycles: u64,
    pub dequeue_cycles: u64,
    pub push_cycles: u64,
    pub pull_cycles: u64,
    /// Total runtime charged to deadline tasks on this runqueue.
    pub exec_clock: u64,
}
