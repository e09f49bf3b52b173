//! CBS entity state
//!
//! Each deadline task carries one entity: the declared parameters, the
//! remaining budget and absolute deadline of the current instance, and the
//! throttle bookkeeping. Pure Earliest Deadline First has no answer to a
//! task that runs longer than it declared; the Constant Bandwidth Server
//! rules implemented here confine every entity within its own reserved
//! bandwidth so a misbehaving task can only hurt itself.
//!
//! The three timing mutators (`setup_new`, `update`, `replenish`) all take
//! the parameter view to account against: normally the entity's own
//! declared parameters, but the top priority-inheritance waiter's when the
//! task is boosted.

use core::sync::atomic::{AtomicBool, Ordering};

use log::warn;

use crate::time::dl_time_before;
use crate::types::{DlFlags, DlParams};

/// Per-entity observability counters. They never steer a decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct DlEntityStats {
    /// Total runtime charged to this entity.
    pub tot_rtime: u64,
    /// Largest single charge observed.
    pub exec_max: u64,
    /// Most recent deadline-miss amount.
    pub last_dmiss: u64,
    /// Worst deadline-miss amount.
    pub dmiss_max: u64,
    /// Most recent runtime-overrun amount.
    pub last_rorun: u64,
    /// Worst runtime-overrun amount.
    pub rorun_max: u64,
}

/// Deadline scheduling state embedded in every task using this class.
#[derive(Debug, Clone, Copy)]
pub struct DlEntity {
    /// Declared `(runtime, deadline, period)`.
    pub params: DlParams,
    /// Reserved bandwidth, `runtime / deadline` in fixed point; withdrawn
    /// from the domain total when the task dies.
    pub bw: u64,
    pub flags: DlFlags,
    /// Remaining budget of the current instance; transiently negative
    /// while an overrun is being charged.
    pub runtime: i64,
    /// Absolute deadline of the current instance.
    pub deadline: u64,
    /// A brand-new instance starts at the next enqueue.
    pub new_instance: bool,
    /// Suspended awaiting replenishment; never on a ready tree while set.
    pub throttled: bool,
    /// Present in its runqueue's ready tree.
    pub queued: bool,
    /// Present in its runqueue's pushable tree.
    pub pushable: bool,
    /// Cached cardinality of the task's affinity mask.
    pub nr_cpus_allowed: u32,
    /// Absolute expiry of the armed replenishment timer, timer-clock
    /// domain. `None` when the timer is idle.
    pub timer_expires: Option<u64>,
    pub stats: DlEntityStats,
}

/// A replenished deadline landing in the past means the entity lagged
/// beyond recovery; shout once, not on every occurrence.
static LAG_WARNED: AtomicBool = AtomicBool::new(false);

impl DlEntity {
    pub fn new(params: DlParams, flags: DlFlags) -> Self {
        Self {
            params,
            bw: params.bandwidth(),
            flags,
            runtime: 0,
            deadline: 0,
            new_instance: true,
            throttled: false,
            queued: false,
            pushable: false,
            nr_cpus_allowed: 1,
            timer_expires: None,
            stats: DlEntityStats::default(),
        }
    }

    /// Tells whether this entity should run ahead of `other`.
    #[inline]
    pub fn preempts(&self, other: &DlEntity) -> bool {
        self.flags.contains(DlFlags::HEAD)
            || (!other.flags.contains(DlFlags::HEAD)
                && dl_time_before(self.deadline, other.deadline))
    }

    #[inline]
    pub fn is_head(&self) -> bool {
        self.flags.contains(DlFlags::HEAD)
    }

    /// A new instance is starting: full budget, deadline one relative
    /// deadline away from now.
    pub fn setup_new(&mut self, clock: u64, pi: &DlParams) {
        debug_assert!(self.new_instance && !self.throttled);

        self.deadline = clock.wrapping_add(pi.deadline);
        self.runtime = pi.runtime as i64;
        self.new_instance = false;
    }

    /// Postpone the deadline and refill the budget, one period at a time,
    /// until the budget is positive again. The loop matters: an overrun
    /// may span several periods.
    pub fn replenish(&mut self, clock: u64, pi: &DlParams) {
        while self.runtime <= 0 {
            self.deadline = self.deadline.wrapping_add(pi.period);
            self.runtime += pi.runtime as i64;
        }

        // The deadline really should now be in the future. If it is not,
        // the entity lagged too far behind; reset it outright so things
        // keep running.
        if dl_time_before(self.deadline, clock) {
            if !LAG_WARNED.swap(true, Ordering::Relaxed) {
                warn!(
                    "replenished deadline {} still behind clock {}; resetting entity",
                    self.deadline, clock
                );
            }
            self.deadline = clock.wrapping_add(pi.deadline);
            self.runtime = pi.runtime as i64;
        }
    }

    /// Can the entity keep its `(deadline, runtime)` pair at time `t`
    /// without exceeding the reserved bandwidth? Cross-multiplied form of
    /// `runtime / (deadline - t) >= dl_runtime / dl_deadline`; all the
    /// operands are relative intervals, so u64 overflow is not a practical
    /// concern.
    pub fn overflows(&self, pi: &DlParams, t: u64) -> bool {
        if self.runtime <= 0 {
            return true;
        }

        let left = pi.deadline.wrapping_mul(self.runtime as u64);
        let right = self.deadline.wrapping_sub(t).wrapping_mul(pi.runtime);

        dl_time_before(right, left)
    }

    /// Enqueue-time update: a fresh pair only when the deadline passed or
    /// the leftover pair would overflow the bandwidth. A task that blocked
    /// early keeps its advantageous deadline on wake.
    pub fn update(&mut self, clock: u64, pi: &DlParams) {
        if self.new_instance {
            self.setup_new(clock, pi);
            return;
        }

        if dl_time_before(self.deadline, clock) || self.overflows(pi, clock) {
            self.deadline = clock.wrapping_add(pi.deadline);
            self.runtime = pi.runtime as i64;
        }
    }

    /// Budget-exhaustion test run after every charge. Returns true when
    /// the entity must be stopped and replenished.
    ///
    /// Running past the deadline means the next instance's budget is
    /// already being spent, so the overrun is charged against it.
    pub fn runtime_exceeded(&mut self, clock: u64) -> bool {
        let dmiss = dl_time_before(self.deadline, clock);
        let rorun = self.runtime <= 0;

        if dmiss {
            let amount = clock.wrapping_sub(self.deadline);
            self.stats.last_dmiss = amount;
            self.stats.dmiss_max = self.stats.dmiss_max.max(amount);
        }
        if rorun {
            let amount = (-self.runtime) as u64;
            self.stats.last_rorun = amount;
            self.stats.rorun_max = self.stats.rorun_max.max(amount);
        }

        if self.flags.contains(DlFlags::HEAD) || (!rorun && !dmiss) {
            return false;
        }

        if dmiss {
            self.runtime = self.runtime.min(0) - clock.wrapping_sub(self.deadline) as i64;
        }

        true
    }
}
