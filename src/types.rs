//! Scheduler type definitions
//!
//! This module contains the types shared across the deadline scheduling
//! class: task and CPU identifiers, affinity masks, entity flags, declared
//! scheduling parameters and the scheduling-class tag used at the seams
//! with the generic scheduler core.

use bitflags::bitflags;

use crate::time::dl_time_before;

/// Task identifier; doubles as the index into the task table.
pub type TaskId = u32;

/// CPU identifier; index into the per-CPU runqueue array.
pub type CpuId = usize;

/// Maximum CPUs a single mask can describe.
pub const MAX_CPUS: usize = 64;

/// Push retry budget when the target runqueue keeps changing under us.
pub const DL_MAX_TRIES: usize = 3;

/// Minimum remaining-budget interval worth arming the hr-tick for (10 us).
pub const HRTICK_MIN_NS: u64 = 10_000;

/// Fixed-point shift for reserved-bandwidth ratios.
pub const BW_SHIFT: u32 = 20;

/// Highest real-time priority level, exclusive.
pub const MAX_RT_PRIO: u8 = 100;

bitflags! {
    /// Per-entity behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DlFlags: u32 {
        /// Strict priority over every non-HEAD deadline entity; exempt
        /// from bandwidth enforcement.
        const HEAD = 1 << 0;
        /// Never throttle; overruns are replenished in place, reclaiming
        /// bandwidth inside the class.
        const BWRECL_DL = 1 << 1;
        /// On throttle, demote to the real-time class until replenishment.
        const BWRECL_RT = 1 << 2;
        /// On throttle, demote to the fair class until replenishment.
        const BWRECL_NR = 1 << 3;
    }
}

bitflags! {
    /// Enqueue hook modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnqueueFlags: u32 {
        /// The task is waking up from sleep.
        const WAKEUP = 1 << 0;
        /// Force the replenishment path instead of the enqueue update.
        const REPLENISH = 1 << 1;
    }
}

/// Which balancing decision `select_task_rq` is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceFlag {
    /// Task wakeup; the only case where we look for a later runqueue.
    Wake,
    /// exec() placement.
    Exec,
    /// fork() placement.
    Fork,
}

/// Scheduling class a task currently belongs to.
///
/// The generic core dispatches between a small fixed set of classes, so
/// this is a closed tag rather than an open trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    Deadline,
    Realtime(u8),
    Fair,
    Idle,
}

impl SchedClass {
    #[inline]
    pub fn is_deadline(&self) -> bool {
        matches!(self, SchedClass::Deadline)
    }
}

/// Declared per-instance scheduling parameters, all in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlParams {
    /// Worst-case runtime budget per instance.
    pub runtime: u64,
    /// Relative deadline of each instance.
    pub deadline: u64,
    /// Activation period; used only to displace replenishments.
    pub period: u64,
}

impl DlParams {
    pub const fn new(runtime: u64, deadline: u64, period: u64) -> Self {
        Self {
            runtime,
            deadline,
            period,
        }
    }

    /// Reserved bandwidth `runtime / deadline` as a `BW_SHIFT` fixed-point
    /// ratio.
    pub fn bandwidth(&self) -> u64 {
        to_ratio(self.deadline, self.runtime)
    }
}

/// `runtime / period` in `BW_SHIFT` fixed point.
#[inline]
pub fn to_ratio(period: u64, runtime: u64) -> u64 {
    if period == 0 {
        return 0;
    }
    ((runtime as u128) << BW_SHIFT) as u64 / period
}

/// CPU affinity mask (up to 64 CPUs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(u64::MAX)
    }

    /// Mask covering CPUs `0..n`.
    pub const fn first_n(n: usize) -> Self {
        if n >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << (cpu & (MAX_CPUS - 1)))
    }

    pub fn set(&mut self, cpu: CpuId) {
        self.0 |= 1 << (cpu & (MAX_CPUS - 1));
    }

    pub fn clear(&mut self, cpu: CpuId) {
        self.0 &= !(1 << (cpu & (MAX_CPUS - 1)));
    }

    #[inline]
    pub const fn is_set(&self, cpu: CpuId) -> bool {
        (self.0 & (1 << (cpu & (MAX_CPUS - 1)))) != 0
    }

    /// Cardinality of the mask.
    #[inline]
    pub const fn weight(&self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn first(&self) -> Option<CpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as CpuId)
        }
    }

    pub const fn intersect(&self, other: &Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Iterate over set CPU indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = CpuId> {
        let bits = self.0;
        (0..MAX_CPUS).filter(move |cpu| bits & (1 << cpu) != 0)
    }
}

/// Key ordering ready and pushable trees: HEAD entities first, then by
/// absolute deadline, with the task id breaking exact ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RqKey {
    pub head: bool,
    pub deadline: u64,
    pub task: TaskId,
}

impl Ord for RqKey {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        use core::cmp::Ordering;

        match (self.head, other.head) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => {
                if self.deadline == other.deadline {
                    self.task.cmp(&other.task)
                } else if dl_time_before(self.deadline, other.deadline) {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
        }
    }
}

impl PartialOrd for RqKey {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Errors surfaced by the parameter-installation interface.
///
/// Scheduling operations themselves never fail; anomalies there become
/// recovery actions instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Parameters violate `0 < runtime <= deadline <= period`.
    InvalidParams,
    /// Affinity mask does not intersect the domain span.
    InvalidAffinity,
    /// Task id does not name a live task.
    NoSuchTask,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpumask_basics() {
        let mut mask = CpuMask::empty();
        assert!(mask.is_empty());
        mask.set(0);
        mask.set(3);
        assert!(mask.is_set(0));
        assert!(!mask.is_set(1));
        assert_eq!(mask.weight(), 2);
        assert_eq!(mask.first(), Some(0));
        mask.clear(0);
        assert_eq!(mask.first(), Some(3));
        assert_eq!(mask.iter_set().collect::<alloc::vec::Vec<_>>(), [3]);
    }

    #[test]
    fn first_n_covers_prefix() {
        let mask = CpuMask::first_n(4);
        assert_eq!(mask.weight(), 4);
        assert!(mask.is_set(3));
        assert!(!mask.is_set(4));
    }

    #[test]
    fn bandwidth_ratio_fixed_point() {
        // 4ms / 10ms = 0.4 of the full-shift unit.
        let params = DlParams::new(4_000_000, 10_000_000, 10_000_000);
        let unit = 1u64 << BW_SHIFT;
        let bw = params.bandwidth();
        assert!(bw > unit * 39 / 100 && bw < unit * 41 / 100);
    }

    #[test]
    fn rq_key_orders_head_first_then_deadline() {
        let head = RqKey {
            head: true,
            deadline: 900,
            task: 7,
        };
        let early = RqKey {
            head: false,
            deadline: 10,
            task: 1,
        };
        let late = RqKey {
            head: false,
            deadline: 20,
            task: 2,
        };
        assert!(head < early);
        assert!(early < late);

        let tie_a = RqKey {
            head: false,
            deadline: 20,
            task: 1,
        };
        assert!(tie_a < late);
    }
}
