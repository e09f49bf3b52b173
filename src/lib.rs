//! Deadline scheduling class
//!
//! This crate implements the deadline scheduling class of a preemptive
//! multi-core kernel: tasks declare a worst-case runtime, a relative
//! deadline and a period, and the class guarantees that a task staying
//! within its declared budget never misses a deadline, while a task that
//! overruns is confined to its own reserved bandwidth.
//!
//! ## Key mechanisms
//!
//! - **EDF dispatch**: per-CPU ready trees ordered by absolute deadline;
//!   the earliest deadline runs, preempting a later one on arrival
//! - **CBS enforcement**: runtime is charged against the instance budget;
//!   an exhausted task is throttled until its replenishment instant,
//!   where the deadline is postponed by whole periods
//! - **Push/pull balancing**: overloaded CPUs push their earliest movable
//!   task toward CPUs running later deadlines, and CPUs about to pick a
//!   later deadline pull earlier work from overloaded peers
//!
//! ## Per-CPU architecture
//!
//! Each CPU owns one deadline runqueue behind its own lock; cross-CPU
//! operations take two runqueue locks in CPU-index order and re-verify
//! their preconditions after the re-lock. A shared root domain tracks
//! which CPUs are overloaded and the admitted bandwidth total.
//!
//! ## Module organization
//!
//! - `types`: identifiers, affinity masks, entity flags, parameters
//! - `time`: wrap-safe modular clock arithmetic
//! - `entity`: per-task CBS state and the budget/deadline rules
//! - `task`: task records and the task table
//! - `runqueue`: per-CPU ready and pushable trees with cached minima
//! - `domain`: root-domain overload mask and bandwidth total
//! - `timer`: replenishment timer queue
//! - `class`: the dispatch hooks consumed by the scheduler core
//! - `smp`: wakeup placement and the push/pull engines
//! - `stats`: observability counters

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod class;
mod domain;
mod entity;
mod runqueue;
mod smp;
mod stats;
mod task;
mod time;
mod timer;
mod types;

pub use class::DlScheduler;
pub use entity::{DlEntity, DlEntityStats};
pub use runqueue::EarliestDl;
pub use stats::DlRqStats;
pub use task::Task;
pub use time::dl_time_before;
pub use types::{
    BalanceFlag, CpuId, CpuMask, DlFlags, DlParams, EnqueueFlags, RqKey, SchedClass, SchedError,
    TaskId, BW_SHIFT, DL_MAX_TRIES, HRTICK_MIN_NS, MAX_CPUS, MAX_RT_PRIO,
};
