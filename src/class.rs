//! Dispatch hooks of the deadline scheduling class
//!
//! This module is the hook table the generic scheduler core drives:
//! enqueue/dequeue, pick/put, tick, yield, fork/dead, class transitions.
//! Every hook runs under the target CPU's runqueue lock, taken here; the
//! balancing entry points that need two runqueues live in `smp`.
//!
//! ## Locking
//!
//! Single-runqueue hooks go through `with_rq`, which takes the runqueue
//! lock, then the task table, and republishes the runqueue's lock-free
//! snapshots before unlocking. Timer callbacks arrive from `run_timers`
//! holding nothing and acquire the target runqueue themselves.

use alloc::vec::Vec;

use log::{debug, info, trace};

use crate::domain::RootDomain;
use crate::entity::DlEntity;
use crate::runqueue::{DlRq, EarliestDl, Rq};
use crate::stats::{get_cycles, DlRqStats};
use crate::task::{task_mut, task_ref, Task, TaskTable, Tasks};
use crate::time::dl_time_before;
use crate::timer::TimerQueue;
use crate::types::{
    CpuId, CpuMask, DlFlags, DlParams, EnqueueFlags, RqKey, SchedClass, SchedError, TaskId,
    HRTICK_MIN_NS, MAX_RT_PRIO,
};

/// The deadline scheduling class of one root domain.
pub struct DlScheduler {
    pub(crate) rqs: Vec<Rq>,
    pub(crate) tasks: TaskTable,
    pub(crate) rd: RootDomain,
    pub(crate) timers: TimerQueue,
}

impl DlScheduler {
    /// Build the class for `nr_cpus` CPUs sharing one root domain.
    pub fn new(nr_cpus: usize) -> Self {
        let rqs = (0..nr_cpus).map(Rq::new).collect();
        info!("deadline class initialized ({} CPUs)", nr_cpus);
        Self {
            rqs,
            tasks: TaskTable::new(),
            rd: RootDomain::new(CpuMask::first_n(nr_cpus)),
            timers: TimerQueue::new(),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.rqs.len()
    }

    /// Lock one runqueue plus the task table, run `f`, republish the
    /// runqueue snapshots.
    pub(crate) fn with_rq<R>(&self, cpu: CpuId, f: impl FnOnce(&mut DlRq, &mut Tasks) -> R) -> R {
        let outer = &self.rqs[cpu];
        let mut rq = outer.lock();
        let mut tasks = self.tasks.lock();
        let ret = f(&mut rq, &mut tasks);
        outer.publish(&rq);
        ret
    }

    // ------------------------------------------------------------------
    // Task installation (the parameter-setting side of the framework)
    // ------------------------------------------------------------------

    /// Install a new deadline task and register its bandwidth with the
    /// domain. The task starts not runnable, with a fresh instance
    /// pending; the embedder enqueues it when it becomes ready.
    pub fn task_create(&self, params: DlParams, affinity: CpuMask) -> Result<TaskId, SchedError> {
        self.task_create_with_flags(params, affinity, DlFlags::empty())
    }

    pub fn task_create_with_flags(
        &self,
        params: DlParams,
        affinity: CpuMask,
        flags: DlFlags,
    ) -> Result<TaskId, SchedError> {
        if params.runtime == 0 || params.runtime > params.deadline || params.deadline > params.period
        {
            return Err(SchedError::InvalidParams);
        }
        let allowed = affinity.intersect(&self.rd.span());
        let Some(first_cpu) = allowed.first() else {
            return Err(SchedError::InvalidAffinity);
        };

        let mut dl = DlEntity::new(params, flags);
        dl.nr_cpus_allowed = allowed.weight();

        let task = Task {
            id: 0,
            class: SchedClass::Deadline,
            policy_deadline: true,
            rt_priority: 0,
            cpu: first_cpu,
            on_rq: false,
            affinity: allowed,
            exec_start: 0,
            sum_exec_runtime: 0,
            pi_waiter: None,
            dl,
        };
        let id = self.tasks.insert(task);
        self.rd.add_bandwidth(params.bandwidth());
        Ok(id)
    }

    /// Pin or move a not-yet-runnable task to a CPU.
    pub fn set_task_cpu(&self, task: TaskId, cpu: CpuId) {
        let mut tasks = self.tasks.lock();
        if let Some(p) = task_mut(&mut tasks, task) {
            debug_assert!(!p.dl.queued);
            p.cpu = cpu;
        }
    }

    /// Record a class change decided by the core. Leaving the deadline
    /// class for real (not a reclaiming demotion) also drops the deadline
    /// policy; the core calls `switched_from`/`switched_to` afterwards.
    pub fn set_task_class(&self, task: TaskId, class: SchedClass) {
        let mut tasks = self.tasks.lock();
        if let Some(p) = task_mut(&mut tasks, task) {
            p.class = class;
            p.policy_deadline = class.is_deadline();
        }
    }

    /// Install or clear the top priority-inheritance waiter's parameter
    /// view for `task`.
    pub fn set_pi_waiter(&self, task: TaskId, waiter: Option<DlParams>) {
        let mut tasks = self.tasks.lock();
        if let Some(p) = task_mut(&mut tasks, task) {
            p.pi_waiter = waiter;
        }
    }

    // ------------------------------------------------------------------
    // Core glue
    // ------------------------------------------------------------------

    /// Advance one runqueue's clock; the core does this on every
    /// scheduler entry.
    pub fn update_rq_clock(&self, cpu: CpuId, now: u64) {
        self.with_rq(cpu, |rq, _| {
            if dl_time_before(rq.clock, now) {
                rq.clock = now;
            }
        });
    }

    /// The core switched `cpu` to `task` (or to a task outside any
    /// class's interest when `None`).
    pub fn set_current(&self, cpu: CpuId, task: Option<TaskId>) {
        self.with_rq(cpu, |rq, _| {
            rq.curr = task;
        });
    }

    pub fn current(&self, cpu: CpuId) -> Option<TaskId> {
        self.with_rq(cpu, |rq, _| rq.curr)
    }

    /// Read and clear the reschedule latch.
    pub fn take_resched(&self, cpu: CpuId) -> bool {
        self.with_rq(cpu, |rq, _| core::mem::take(&mut rq.resched))
    }

    pub fn need_resched(&self, cpu: CpuId) -> bool {
        self.with_rq(cpu, |rq, _| rq.resched)
    }

    // ------------------------------------------------------------------
    // Dispatch hooks
    // ------------------------------------------------------------------

    /// Admit `task` to `cpu`'s ready tree. A throttled task stays out;
    /// its timer callback finishes the job.
    pub fn enqueue_task(&self, cpu: CpuId, task: TaskId, flags: EnqueueFlags) {
        let cycles = get_cycles();
        self.with_rq(cpu, |rq, tasks| {
            if let Some(p) = task_mut(tasks, task) {
                p.on_rq = true;
                p.cpu = cpu;
            }
            self.enqueue_inner(rq, tasks, task, flags);
            rq.stats.nr_enqueue += 1;
            rq.stats.enqueue_cycles += get_cycles() - cycles;
        });
    }

    /// Remove `task` from the ready and pushable trees, charging the
    /// current task's runtime first.
    pub fn dequeue_task(&self, cpu: CpuId, task: TaskId, _flags: EnqueueFlags) {
        let cycles = get_cycles();
        self.with_rq(cpu, |rq, tasks| {
            let throttled = task_ref(tasks, task).is_some_and(|p| p.dl.throttled);
            if let Some(p) = task_mut(tasks, task) {
                p.on_rq = false;
            }
            if !throttled {
                self.update_curr_inner(rq, tasks);
                self.dequeue_tree_inner(rq, tasks, task);
            }
            rq.stats.nr_dequeue += 1;
            rq.stats.dequeue_cycles += get_cycles() - cycles;
        });
    }

    /// Voluntary yield: sleep until the next instance with a fresh
    /// budget. Forcing the runtime to zero makes the very next charge
    /// throttle the task, and the replenishment plus `new_instance` hand
    /// it new parameters on wakeup.
    pub fn yield_task(&self, cpu: CpuId) {
        self.with_rq(cpu, |rq, tasks| {
            if let Some(curr) = rq.curr {
                if let Some(p) = task_mut(tasks, curr) {
                    if p.is_dl_class() && p.dl.runtime > 0 {
                        p.dl.new_instance = true;
                        p.dl.runtime = 0;
                    }
                }
            }
            self.update_curr_inner(rq, tasks);
        });
    }

    /// `task` became runnable on `cpu`; decide whether the running task
    /// must give way.
    pub fn check_preempt_curr(&self, cpu: CpuId, task: TaskId) {
        self.with_rq(cpu, |rq, tasks| {
            self.check_preempt_inner(rq, tasks, task);
        });
    }

    /// EDF pick: the leftmost ready entity, if any. The chosen task stops
    /// being pushable and starts a fresh execution stint.
    pub fn pick_next_task(&self, cpu: CpuId) -> Option<TaskId> {
        self.with_rq(cpu, |rq, tasks| {
            let key = rq.leftmost()?;
            if let Some(p) = task_mut(tasks, key.task) {
                p.exec_start = rq.clock;
                if p.dl.pushable {
                    p.dl.pushable = false;
                    rq.pushable_remove(key);
                }
            }
            trace!("cpu{} picks task {} (deadline {})", cpu, key.task, key.deadline);
            Some(key.task)
        })
    }

    /// The core is switching away from `task`: charge it and put it back
    /// among the pushable if it still qualifies.
    pub fn put_prev_task(&self, cpu: CpuId, task: TaskId) {
        self.with_rq(cpu, |rq, tasks| {
            let throttled = task_ref(tasks, task).is_some_and(|p| p.dl.throttled);
            if throttled {
                return;
            }
            self.update_curr_inner(rq, tasks);
            if let Some(p) = task_mut(tasks, task) {
                p.exec_start = 0;
                if p.dl.queued && p.dl.nr_cpus_allowed > 1 && !p.dl.pushable {
                    let key = entity_key(p);
                    p.dl.pushable = true;
                    rq.pushable_insert(key);
                }
            }
        });
    }

    /// Periodic tick. Returns the remaining-budget interval to aim the
    /// hr-tick at, when it is worth arming.
    pub fn task_tick(&self, cpu: CpuId, task: TaskId, queued: bool) -> Option<u64> {
        self.with_rq(cpu, |rq, tasks| {
            self.update_curr_inner(rq, tasks);

            if !queued {
                return None;
            }
            let p = task_ref(tasks, task)?;
            if !p.is_dl_class() || p.dl.runtime <= 0 {
                return None;
            }
            let remaining = p.dl.params.runtime as i64 - p.dl.runtime;
            if remaining > HRTICK_MIN_NS as i64 {
                Some(remaining as u64)
            } else {
                None
            }
        })
    }

    /// A forked child of a deadline task starts throttled; someone must
    /// install parameters before it runs.
    pub fn task_fork(&self, task: TaskId) {
        let mut tasks = self.tasks.lock();
        if let Some(p) = task_mut(&mut tasks, task) {
            p.dl.throttled = true;
            p.dl.new_instance = false;
        }
    }

    /// The task is gone: withdraw its bandwidth and synchronously cancel
    /// its timer. No runqueue lock may be held here, since the timer
    /// callback takes one.
    pub fn task_dead(&self, task: TaskId) {
        let (bw, armed) = {
            let tasks = self.tasks.lock();
            match task_ref(&tasks, task) {
                Some(p) => {
                    debug_assert!(!p.dl.queued);
                    (p.dl.bw, p.dl.timer_expires)
                }
                None => return,
            }
        };

        self.rd.sub_bandwidth(bw);
        if let Some(expires) = armed {
            self.timers.cancel(expires, task);
        }
        self.tasks.remove(task);
    }

    /// The core re-adopted the runqueue's current task into this class
    /// (e.g. after a parameter change): restart its stint, and make sure
    /// a running task is not pushable.
    pub fn set_curr_task(&self, cpu: CpuId) {
        self.with_rq(cpu, |rq, tasks| {
            let Some(curr) = rq.curr else { return };
            if let Some(p) = task_mut(tasks, curr) {
                p.exec_start = rq.clock;
                if p.dl.pushable {
                    let key = entity_key(p);
                    p.dl.pushable = false;
                    rq.pushable_remove(key);
                }
            }
        });
    }

    /// Compute the wake-up instant that guarantees a full fresh budget,
    /// given an optional requested absolute time. The caller sleeps until
    /// the returned instant; the next enqueue renews the parameters.
    pub fn wait_interval(&self, task: TaskId, rqtp: Option<u64>) -> u64 {
        let cpu = {
            let tasks = self.tasks.lock();
            match task_ref(&tasks, task) {
                Some(p) => p.cpu,
                None => return rqtp.unwrap_or(0),
            }
        };

        self.with_rq(cpu, |_rq, tasks| {
            let Some(p) = task_mut(tasks, task) else {
                return rqtp.unwrap_or(0);
            };
            let dl = &p.dl;
            let own = dl.params;

            // Without a requested time, sleep to the start of the next
            // activation period.
            let mut wakeup = match rqtp {
                None => dl
                    .deadline
                    .wrapping_add(own.period)
                    .wrapping_sub(own.deadline),
                Some(t) => t,
            };

            // Waking before the deadline with a pair that would still fit
            // the bandwidth would deny the renewal; postpone to the last
            // instant where a replenishment is unavoidable.
            if let Some(t) = rqtp {
                if dl_time_before(t, dl.deadline) && !dl.overflows(&own, t) {
                    let ibw =
                        (dl.runtime.max(0) as u128 * own.period as u128 / own.runtime as u128) as u64;
                    wakeup = dl.deadline.wrapping_sub(ibw);
                }
            }

            p.dl.new_instance = true;
            wakeup
        })
    }

    // ------------------------------------------------------------------
    // Replenishment timers
    // ------------------------------------------------------------------

    /// Advance the timer clock and deliver every due replenishment.
    pub fn run_timers(&self, timer_now: u64) {
        for (_, task) in self.timers.take_due(timer_now) {
            self.replenish_timer_fired(task);
        }
    }

    /// Bandwidth-enforcement timer callback. The task was throttled when
    /// the timer was armed; whether we replenish here or leave it to the
    /// next enqueue depends on whether it is still runnable.
    fn replenish_timer_fired(&self, task: TaskId) {
        let Some(cpu) = ({
            let tasks = self.tasks.lock();
            task_ref(&tasks, task).map(|p| p.cpu)
        }) else {
            return;
        };

        let (requeued, push) = self.with_rq(cpu, |rq, tasks| {
            let Some(p) = task_mut(tasks, task) else {
                return (false, false);
            };
            p.dl.timer_expires = None;

            // The task may have left the deadline policy since the timer
            // was armed; nothing to do then. A class demoted only for
            // bandwidth reclaiming comes back here.
            if !p.policy_deadline {
                return (false, false);
            }
            if !p.is_dl_class() {
                p.class = SchedClass::Deadline;
            }

            p.dl.throttled = false;
            let on_rq = p.on_rq;
            if on_rq {
                self.enqueue_inner(rq, tasks, task, EnqueueFlags::REPLENISH);
                self.check_preempt_inner(rq, tasks, task);
            }
            (on_rq, on_rq && rq.overloaded)
        });

        if requeued {
            debug!("task {} replenished on cpu{}", task, cpu);
        }
        if push {
            // Queueing the task back may have overloaded the runqueue.
            self.push_dl_task(cpu);
        }
    }

    /// Arm the enforcement timer at the replenishment instant, adjusted
    /// for the skew between this runqueue's clock and the timer clock.
    /// Returns false when the instant already passed (or the entity is
    /// exempt) and the caller must replenish in place.
    fn start_dl_timer(&self, rq: &DlRq, tasks: &mut Tasks, task: TaskId, boosted: bool) -> bool {
        let Some(p) = task_mut(tasks, task) else {
            return false;
        };

        // A boosted lock holder must keep running, and a reclaiming
        // entity is allowed to overrun inside the class.
        if boosted || p.dl.flags.contains(DlFlags::BWRECL_DL) {
            return false;
        }

        let timer_now = self.timers.now();
        let skew = timer_now.wrapping_sub(rq.clock);
        let expires = p.dl.deadline.wrapping_add(skew);

        if self.timers.start(expires, task) {
            p.dl.timer_expires = Some(expires);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Internals shared with the balancing paths
    // ------------------------------------------------------------------

    /// Enqueue under held locks: CBS parameter refresh, tree insertion,
    /// pushable membership.
    pub(crate) fn enqueue_inner(
        &self,
        rq: &mut DlRq,
        tasks: &mut Tasks,
        task: TaskId,
        flags: EnqueueFlags,
    ) {
        let Some(p) = task_mut(tasks, task) else {
            return;
        };

        // A throttled task stays off the tree; the timer callback (which
        // has not run yet, or we would not be here) finishes the enqueue.
        if p.dl.throttled {
            return;
        }

        let pi = p.pi_params();
        if !p.dl.new_instance && flags.contains(EnqueueFlags::REPLENISH) {
            p.dl.replenish(rq.clock, &pi);
        } else {
            p.dl.update(rq.clock, &pi);
        }

        debug_assert!(!p.dl.queued);
        let key = entity_key(p);
        let migratory = p.dl.nr_cpus_allowed > 1;
        p.dl.queued = true;
        rq.insert_entity(key, migratory, &self.rd);

        if !rq.is_current(task) && migratory {
            p.dl.pushable = true;
            rq.pushable_insert(key);
        }
    }

    /// Tree and pushable removal under held locks; tolerant of entities
    /// already off either tree.
    pub(crate) fn dequeue_tree_inner(&self, rq: &mut DlRq, tasks: &mut Tasks, task: TaskId) {
        let Some(p) = task_mut(tasks, task) else {
            return;
        };
        let key = entity_key(p);
        if p.dl.queued {
            p.dl.queued = false;
            rq.remove_entity(key, p.dl.nr_cpus_allowed > 1, &self.rd);
        }
        if p.dl.pushable {
            p.dl.pushable = false;
            rq.pushable_remove(key);
        }
    }

    /// Charge the running task's runtime and enforce its bandwidth.
    /// Called on every tick, on yield, on dequeue and on put-previous.
    pub(crate) fn update_curr_inner(&self, rq: &mut DlRq, tasks: &mut Tasks) {
        let Some(curr) = rq.curr else {
            return;
        };

        let exceeded = {
            let Some(p) = task_mut(tasks, curr) else {
                return;
            };
            if !p.is_dl_class() || !p.dl.queued {
                return;
            }

            let delta = rq.clock.wrapping_sub(p.exec_start);
            let delta = if (delta as i64) < 0 { 0 } else { delta };

            p.dl.stats.exec_max = p.dl.stats.exec_max.max(delta);
            p.dl.stats.tot_rtime += delta;
            p.sum_exec_runtime += delta;
            rq.stats.exec_clock += delta;
            p.exec_start = rq.clock;

            p.dl.runtime -= delta as i64;
            p.dl.runtime_exceeded(rq.clock)
        };

        if !exceeded {
            return;
        }

        self.dequeue_tree_inner(rq, tasks, curr);

        let boosted = task_ref(tasks, curr).is_some_and(Task::boosted);
        if self.start_dl_timer(rq, tasks, curr, boosted) {
            self.throttle_curr(tasks, curr);
            debug!("task {} throttled on cpu{}", curr, rq.cpu);
        } else {
            // Replenishment instant already behind us (or the entity is
            // exempt from throttling): refill in place.
            self.enqueue_inner(rq, tasks, curr, EnqueueFlags::REPLENISH);
        }

        rq.resched = true;
    }

    /// Suspend the exhausted current task, demoting it to the class its
    /// reclaiming flags ask for.
    fn throttle_curr(&self, tasks: &mut Tasks, task: TaskId) {
        let Some(p) = task_mut(tasks, task) else {
            return;
        };
        p.dl.throttled = true;

        if p.dl.flags.contains(DlFlags::BWRECL_RT) {
            p.class = SchedClass::Realtime(MAX_RT_PRIO - 1 - p.rt_priority);
        } else if p.dl.flags.contains(DlFlags::BWRECL_NR) {
            p.class = SchedClass::Fair;
        }
    }

    /// Preemption test for a task that just became runnable here.
    pub(crate) fn check_preempt_inner(&self, rq: &mut DlRq, tasks: &Tasks, task: TaskId) {
        let Some(p) = task_ref(tasks, task) else {
            return;
        };
        let curr = rq.curr.and_then(|id| task_ref(tasks, id));

        let preempt = match curr {
            None => true,
            Some(c) => !c.is_dl_class() || (p.is_dl_class() && p.dl.preempts(&c.dl)),
        };
        if preempt {
            rq.resched = true;
            return;
        }

        // Exact deadline tie with the running deadline task: decide
        // between rescheduling and leaving placement to push/pull.
        if let Some(c) = curr {
            if p.dl.deadline == c.dl.deadline && !rq.resched {
                self.check_preempt_equal(rq, tasks, task);
            }
        }
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub fn rq_stats(&self, cpu: CpuId) -> DlRqStats {
        self.with_rq(cpu, |rq, _| rq.stats)
    }

    pub fn rq_earliest(&self, cpu: CpuId) -> EarliestDl {
        self.with_rq(cpu, |rq, _| rq.earliest)
    }

    pub fn rq_nr_running(&self, cpu: CpuId) -> usize {
        self.with_rq(cpu, |rq, _| rq.nr_running)
    }

    pub fn rq_overloaded(&self, cpu: CpuId) -> bool {
        self.with_rq(cpu, |rq, _| rq.overloaded)
    }

    pub fn rq_nr_migratory(&self, cpu: CpuId) -> usize {
        self.with_rq(cpu, |rq, _| rq.nr_migratory)
    }

    pub fn domain_overload_mask(&self) -> CpuMask {
        self.rd.overload_mask()
    }

    pub fn rq_has_pushable(&self, cpu: CpuId) -> bool {
        self.with_rq(cpu, |rq, _| rq.has_pushable())
    }

    pub fn rq_pushable_leftmost(&self, cpu: CpuId) -> Option<RqKey> {
        self.with_rq(cpu, |rq, _| rq.pushable_leftmost())
    }

    pub fn rq_leftmost(&self, cpu: CpuId) -> Option<RqKey> {
        self.with_rq(cpu, |rq, _| rq.leftmost())
    }

    pub fn domain_overloaded(&self) -> bool {
        self.rd.overloaded()
    }

    pub fn total_bandwidth(&self) -> u64 {
        self.rd.total_bandwidth()
    }

    pub fn timer_armed(&self, task: TaskId) -> bool {
        let tasks = self.tasks.lock();
        task_ref(&tasks, task).is_some_and(|p| p.dl.timer_expires.is_some())
    }

    /// Copy of a task record for inspection.
    pub fn task_snapshot(&self, task: TaskId) -> Option<Task> {
        let tasks = self.tasks.lock();
        task_ref(&tasks, task).copied()
    }
}

/// Ready/pushable tree key of an entity in its current state.
#[inline]
pub(crate) fn entity_key(p: &Task) -> RqKey {
    RqKey {
        head: p.dl.is_head(),
        deadline: p.dl.deadline,
        task: p.id,
    }
}
