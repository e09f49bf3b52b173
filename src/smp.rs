//! Cross-CPU balancing for deadline tasks
//!
//! Dispatch is strictly per-CPU EDF; these paths keep the earliest
//! deadlines near the front of *some* CPU's tree. Pushing relocates the
//! earliest pushable task from an overloaded runqueue to one whose running
//! deadline is later; pulling steals an earlier-deadline task from a
//! remote overloaded runqueue before we pick.
//!
//! Placement scans read the runqueues' lock-free snapshots and never take
//! a foreign lock. Whenever two runqueues must really be locked, they are
//! taken in CPU-index order, which means the holder's lock is dropped
//! first and every precondition is re-verified afterwards.

use log::debug;

use crate::class::{entity_key, DlScheduler};
use crate::runqueue::DlRq;
use crate::stats::get_cycles;
use crate::task::{task_mut, task_ref, Tasks};
use crate::time::dl_time_before;
use crate::types::{BalanceFlag, CpuId, CpuMask, EnqueueFlags, TaskId, DL_MAX_TRIES};

enum PushDecision {
    Stop,
    Candidate(TaskId),
}

impl DlScheduler {
    // ------------------------------------------------------------------
    // Wakeup placement
    // ------------------------------------------------------------------

    /// Pick a runqueue for a waking task. Only a wakeup triggers a
    /// search: an earlier-deadline wakee should land where it will
    /// actually run, and a pinned earlier-deadline current should not be
    /// disturbed.
    pub fn select_task_rq(&self, task: TaskId, sd_flag: BalanceFlag) -> CpuId {
        let Some((task_cpu, migratory)) = ({
            let tasks = self.tasks.lock();
            task_ref(&tasks, task).map(|p| (p.cpu, p.dl.nr_cpus_allowed > 1))
        }) else {
            return 0;
        };

        if sd_flag != BalanceFlag::Wake {
            return task_cpu;
        }

        let wants_later = self.with_rq(task_cpu, |rq, tasks| {
            let Some(c) = rq.curr.and_then(|id| task_ref(tasks, id)) else {
                return false;
            };
            let Some(p) = task_ref(tasks, task) else {
                return false;
            };
            c.is_dl_class() && (c.dl.nr_cpus_allowed < 2 || c.dl.preempts(&p.dl)) && migratory
        });

        if wants_later {
            if let Some(cpu) = self.find_later_rq(task, task_cpu) {
                return cpu;
            }
        }
        task_cpu
    }

    /// Scan the domain for CPUs where `deadline` would be the earliest.
    /// Returns the preferred candidate (an idle CPU if any, otherwise the
    /// one with the latest current earliest, i.e. the most headroom) and
    /// the full candidate mask.
    fn latest_cpu_find(&self, deadline: u64, affinity: CpuMask) -> (Option<CpuId>, CpuMask) {
        let mut mask = CpuMask::empty();
        let mut found = None;
        let mut found_idle = false;
        let mut max_dl = 0u64;

        for cpu in self.rd.span().iter_set() {
            if cpu >= self.rqs.len() {
                break;
            }
            if !affinity.is_set(cpu) {
                continue;
            }
            let nr_running = self.rqs[cpu].snapshot_nr_running();
            let earliest = self.rqs[cpu].snapshot_earliest();

            if nr_running == 0 || dl_time_before(deadline, earliest) {
                mask.set(cpu);
                if !found_idle && nr_running == 0 {
                    found_idle = true;
                    found = Some(cpu);
                } else if !found_idle && dl_time_before(max_dl, earliest) {
                    max_dl = earliest;
                    found = Some(cpu);
                }
            }
        }

        (found, mask)
    }

    /// Best CPU whose running deadline (if any) is later than `task`'s.
    /// Cache locality first: the CPU the task last ran on, then the
    /// calling CPU, then the scan's own preference.
    pub(crate) fn find_later_rq(&self, task: TaskId, this_cpu: CpuId) -> Option<CpuId> {
        let (deadline, affinity, nr_allowed, task_cpu) = {
            let tasks = self.tasks.lock();
            let p = task_ref(&tasks, task)?;
            (p.dl.deadline, p.affinity, p.dl.nr_cpus_allowed, p.cpu)
        };

        if nr_allowed == 1 {
            return None;
        }

        let (best, mask) = self.latest_cpu_find(deadline, affinity);
        best?;

        if mask.is_set(task_cpu) {
            return Some(task_cpu);
        }
        if mask.is_set(this_cpu) {
            return Some(this_cpu);
        }
        best
    }

    /// Deadline tie between a newcomer and the running task: reschedule
    /// only when neither can be placed elsewhere. If the newcomer can
    /// move, push/pull will place it; if the current cannot move at all,
    /// a reschedule buys nothing.
    pub(crate) fn check_preempt_equal(&self, rq: &mut DlRq, tasks: &Tasks, task: TaskId) {
        let Some(c) = rq.curr.and_then(|id| task_ref(tasks, id)) else {
            return;
        };
        if c.dl.nr_cpus_allowed == 1 || self.latest_cpu_find(c.dl.deadline, c.affinity).0.is_none()
        {
            return;
        }

        let Some(p) = task_ref(tasks, task) else {
            return;
        };
        if p.dl.nr_cpus_allowed != 1 && self.latest_cpu_find(p.dl.deadline, p.affinity).0.is_some()
        {
            return;
        }

        rq.resched = true;
    }

    // ------------------------------------------------------------------
    // Push engine
    // ------------------------------------------------------------------

    /// Push every task we can away from `cpu`; terminates because each
    /// successful push moves or drops a pushable task.
    pub fn push_dl_tasks(&self, cpu: CpuId) {
        while self.push_dl_task(cpu) {}
    }

    /// Try to relocate the earliest pushable task to a CPU whose running
    /// deadline is later. Returns true when a task was moved or given up
    /// on (so the caller retries for the next one).
    pub(crate) fn push_dl_task(&self, this_cpu: CpuId) -> bool {
        let cycles = get_cycles();
        let ret = self.push_one(this_cpu);
        self.with_rq(this_cpu, |rq, _| {
            rq.stats.nr_push += 1;
            rq.stats.push_cycles += get_cycles() - cycles;
        });
        ret
    }

    fn push_one(&self, this_cpu: CpuId) -> bool {
        let mut prev_candidate: Option<TaskId> = None;

        loop {
            let next = match self.with_rq(this_cpu, |rq, tasks| self.push_candidate(rq, tasks)) {
                PushDecision::Stop => return false,
                PushDecision::Candidate(t) => t,
            };

            if prev_candidate == Some(next) {
                // We already failed to place this one; drop it from the
                // pushable tree and let some CPU pull it when ready.
                return self.with_rq(this_cpu, |rq, tasks| {
                    if rq.pushable_leftmost().map(|k| k.task) == Some(next) {
                        if let Some(p) = task_mut(tasks, next) {
                            if p.dl.pushable {
                                let key = entity_key(p);
                                p.dl.pushable = false;
                                rq.pushable_remove(key);
                            }
                        }
                    }
                    true
                });
            }
            if prev_candidate.is_some() {
                self.with_rq(this_cpu, |rq, _| rq.stats.nr_retry_push += 1);
            }
            prev_candidate = Some(next);

            if self.try_push_task(this_cpu, next) {
                return true;
            }
        }
    }

    /// Candidate selection under our own lock. Rescheduling in place is
    /// cheaper than a migration when the pushable leader would preempt a
    /// movable current task.
    fn push_candidate(&self, rq: &mut DlRq, tasks: &Tasks) -> PushDecision {
        if !rq.overloaded || !rq.has_pushable() {
            return PushDecision::Stop;
        }
        let Some(key) = rq.pushable_leftmost() else {
            return PushDecision::Stop;
        };
        if rq.is_current(key.task) {
            debug_assert!(false, "running task on the pushable tree");
            return PushDecision::Stop;
        }

        if let Some(c) = rq.curr.and_then(|id| task_ref(tasks, id)) {
            if c.is_dl_class()
                && dl_time_before(key.deadline, c.dl.deadline)
                && c.dl.nr_cpus_allowed > 1
            {
                rq.resched = true;
                return PushDecision::Stop;
            }
        }

        PushDecision::Candidate(key.task)
    }

    /// Find a later runqueue for `next` and migrate it there, retrying a
    /// bounded number of times when the world changes between the
    /// unlocked scan and the locked re-check.
    fn try_push_task(&self, this_cpu: CpuId, next: TaskId) -> bool {
        for _ in 0..DL_MAX_TRIES {
            let Some(target) = self.find_later_rq(next, this_cpu) else {
                return false;
            };
            if target == this_cpu {
                return false;
            }

            let (mut this_rq, mut later_rq) = self.lock_pair(this_cpu, target);
            let mut tasks = self.tasks.lock();

            // Both locks were dropped on the way here; the candidate may
            // have migrated, started running, slept or been pinned.
            let task_ok = task_ref(&tasks, next).is_some_and(|p| {
                p.cpu == this_cpu
                    && p.on_rq
                    && p.dl.queued
                    && p.dl.nr_cpus_allowed > 1
                    && p.affinity.is_set(target)
                    && !this_rq.is_current(next)
            });
            if !task_ok {
                return false;
            }

            let deadline = match task_ref(&tasks, next) {
                Some(p) => p.dl.deadline,
                None => return false,
            };
            let still_later =
                !later_rq.has_ready() || dl_time_before(deadline, later_rq.earliest.curr);

            if still_later {
                self.update_curr_inner(&mut this_rq, &mut tasks);
                self.dequeue_tree_inner(&mut this_rq, &mut tasks, next);
                if let Some(p) = task_mut(&mut tasks, next) {
                    p.cpu = target;
                }
                self.enqueue_inner(&mut later_rq, &mut tasks, next, EnqueueFlags::empty());
                later_rq.resched = true;
                this_rq.stats.nr_pushed_away += 1;

                self.rqs[this_cpu].publish(&this_rq);
                self.rqs[target].publish(&later_rq);
                debug!("pushed task {} cpu{} -> cpu{}", next, this_cpu, target);
                return true;
            }
            // Target is no longer later than the candidate; try again.
        }
        false
    }

    // ------------------------------------------------------------------
    // Pull engine
    // ------------------------------------------------------------------

    /// Steal earlier-deadline work from overloaded remote runqueues.
    /// Keeps scanning after a successful pull in case an even earlier
    /// task is waiting elsewhere.
    pub(crate) fn pull_dl_task(&self, this_cpu: CpuId) -> bool {
        let cycles = get_cycles();
        let mut pulled = false;
        let mut dmin: Option<u64> = None;

        if self.rd.overloaded() {
            for cpu in self.rd.overload_mask().iter_set() {
                if cpu == this_cpu || cpu >= self.rqs.len() {
                    continue;
                }

                // Racy glance: the remote can give up at most its second
                // earliest, so skip it when ours is already ahead.
                if self.rqs[this_cpu].snapshot_nr_running() > 0
                    && dl_time_before(
                        self.rqs[this_cpu].snapshot_earliest(),
                        self.rqs[cpu].snapshot_earliest_next(),
                    )
                {
                    continue;
                }

                let (mut this_rq, mut src_rq) = self.lock_pair(this_cpu, cpu);
                let mut tasks = self.tasks.lock();

                // Never take the remote's last runnable deadline task.
                if src_rq.nr_running > 1 {
                    if let Some((cand, cand_deadline)) =
                        pick_next_earliest_dl_task(&src_rq, &tasks, this_cpu)
                    {
                        let beats_prev = dmin.map_or(true, |d| dl_time_before(cand_deadline, d));
                        let helps_here = !this_rq.has_ready()
                            || dl_time_before(cand_deadline, this_rq.earliest.curr);
                        // Taking the task the remote itself will run next
                        // would only shift the problem around.
                        let ahead_of_src_curr = src_rq
                            .curr
                            .and_then(|id| task_ref(&tasks, id))
                            .filter(|c| c.is_dl_class())
                            .map_or(true, |c| dl_time_before(cand_deadline, c.dl.deadline));

                        if beats_prev && helps_here && ahead_of_src_curr {
                            self.update_curr_inner(&mut src_rq, &mut tasks);
                            self.dequeue_tree_inner(&mut src_rq, &mut tasks, cand);
                            if let Some(p) = task_mut(&mut tasks, cand) {
                                p.cpu = this_cpu;
                            }
                            self.enqueue_inner(
                                &mut this_rq,
                                &mut tasks,
                                cand,
                                EnqueueFlags::empty(),
                            );
                            this_rq.stats.nr_pulled_here += 1;
                            dmin = Some(cand_deadline);
                            pulled = true;
                            debug!("pulled task {} cpu{} -> cpu{}", cand, cpu, this_cpu);
                        }
                    }
                }

                self.rqs[this_cpu].publish(&this_rq);
                self.rqs[cpu].publish(&src_rq);
            }
        }

        self.with_rq(this_cpu, |rq, _| {
            rq.stats.nr_pull += 1;
            rq.stats.pull_cycles += get_cycles() - cycles;
        });
        pulled
    }

    // ------------------------------------------------------------------
    // Scheduler entry/exit and state-change hooks
    // ------------------------------------------------------------------

    /// Before picking: if the previous task was a deadline task we may
    /// have just lost our earliest, so look around for a better one.
    pub fn pre_schedule(&self, cpu: CpuId, prev: TaskId) {
        let prev_dl = {
            let tasks = self.tasks.lock();
            task_ref(&tasks, prev).is_some_and(|p| p.is_dl_class())
        };
        if prev_dl {
            self.pull_dl_task(cpu);
        }
    }

    /// After a context switch: drain the pushable backlog.
    pub fn post_schedule(&self, cpu: CpuId) {
        self.push_dl_tasks(cpu);
    }

    /// A task woke on `cpu` but is not running there; if it cannot
    /// preempt the current task and a push could place it, push now
    /// rather than waiting for the next scheduler entry.
    pub fn task_woken(&self, cpu: CpuId, task: TaskId) {
        let do_push = self.with_rq(cpu, |rq, tasks| {
            let Some(p) = task_ref(tasks, task) else {
                return false;
            };
            let Some(c) = rq.curr.and_then(|id| task_ref(tasks, id)) else {
                return false;
            };
            !rq.is_current(task)
                && !rq.resched
                && rq.has_pushable()
                && p.dl.nr_cpus_allowed > 1
                && c.is_dl_class()
                && (c.dl.nr_cpus_allowed < 2 || c.dl.preempts(&p.dl))
        });

        if do_push {
            self.push_dl_tasks(cpu);
        }
    }

    /// Affinity update: fix pushable membership and the migratory count
    /// when the task is queued, then record the new mask.
    pub fn set_cpus_allowed(&self, task: TaskId, mask: CpuMask) {
        let mask = mask.intersect(&self.rd.span());
        let Some(cpu) = ({
            let tasks = self.tasks.lock();
            task_ref(&tasks, task).map(|p| p.cpu)
        }) else {
            return;
        };

        self.with_rq(cpu, |rq, tasks| {
            let Some(p) = task_mut(tasks, task) else {
                return;
            };
            let weight = mask.weight();
            let was_migratory = p.dl.nr_cpus_allowed > 1;
            let now_migratory = weight > 1;

            if p.dl.queued && weight != p.dl.nr_cpus_allowed {
                if !rq.is_current(task) {
                    let key = entity_key(p);
                    if p.dl.pushable {
                        p.dl.pushable = false;
                        rq.pushable_remove(key);
                    }
                    if now_migratory {
                        p.dl.pushable = true;
                        rq.pushable_insert(key);
                    }
                }
                rq.migratory_changed(was_migratory, now_migratory, &self.rd);
            }

            p.affinity = mask;
            p.dl.nr_cpus_allowed = weight;
        });
    }

    /// The runqueue joined the domain: replay its overload bit.
    pub fn rq_online(&self, cpu: CpuId) {
        self.with_rq(cpu, |rq, _| {
            if !rq.online {
                rq.online = true;
                if rq.overloaded {
                    self.rd.set_overload(cpu);
                }
            }
        });
    }

    /// The runqueue left the domain: hide its overload bit.
    pub fn rq_offline(&self, cpu: CpuId) {
        self.with_rq(cpu, |rq, _| {
            if rq.online {
                if rq.overloaded {
                    self.rd.clear_overload(cpu);
                }
                rq.online = false;
            }
        });
    }

    /// The task left the deadline class: cancel any pending timer unless
    /// the policy still wants it back, and backfill this runqueue if it
    /// just lost its only deadline task.
    pub fn switched_from(&self, cpu: CpuId, task: TaskId) {
        let cancel = {
            let mut tasks = self.tasks.lock();
            match task_mut(&mut tasks, task) {
                Some(p) if !p.policy_deadline => p.dl.timer_expires.take(),
                _ => None,
            }
        };
        if let Some(expires) = cancel {
            self.timers.cancel(expires, task);
        }

        let empty = self.with_rq(cpu, |rq, _| !rq.has_ready());
        if empty {
            self.pull_dl_task(cpu);
        }
    }

    /// The task joined the deadline class; it may overload the runqueue,
    /// so try pushing someone off before testing for preemption.
    pub fn switched_to(&self, cpu: CpuId, task: TaskId) {
        let (throttled, current, overloaded) = self.with_rq(cpu, |rq, tasks| {
            let throttled = task_ref(tasks, task).is_some_and(|p| p.dl.throttled);
            (throttled, rq.is_current(task), rq.overloaded)
        });

        // The preemption check happens when the replenishment arrives.
        if throttled || current {
            return;
        }

        let mut check_resched = true;
        if overloaded && self.push_dl_task(cpu) {
            let still_here = {
                let tasks = self.tasks.lock();
                task_ref(&tasks, task).is_some_and(|p| p.cpu == cpu)
            };
            if !still_here {
                check_resched = false;
            }
        }
        if check_resched {
            self.check_preempt_curr(cpu, task);
        }
    }

    /// The task's deadline parameters changed. Without the old deadline
    /// we cannot tell which way they moved, so consider both a pull and a
    /// reschedule.
    pub fn prio_changed(&self, cpu: CpuId, task: TaskId) {
        let current = self.with_rq(cpu, |rq, _| rq.is_current(task));

        if current {
            let overloaded = self.with_rq(cpu, |rq, _| rq.overloaded);
            if !overloaded {
                self.pull_dl_task(cpu);
            }

            self.with_rq(cpu, |rq, tasks| {
                if !rq.is_current(task) {
                    return;
                }
                let Some(p) = task_ref(tasks, task) else {
                    return;
                };
                if rq.earliest.curr != 0 && dl_time_before(rq.earliest.curr, p.dl.deadline) {
                    rq.resched = true;
                }
            });
        } else {
            self.switched_to(cpu, task);
        }
    }

    /// Lock two runqueues in CPU-index order, returning the guards as
    /// (`this`, `that`).
    fn lock_pair(
        &self,
        this: CpuId,
        that: CpuId,
    ) -> (spin::MutexGuard<'_, DlRq>, spin::MutexGuard<'_, DlRq>) {
        debug_assert_ne!(this, that);
        if this < that {
            let a = self.rqs[this].lock();
            let b = self.rqs[that].lock();
            (a, b)
        } else {
            let b = self.rqs[that].lock();
            let a = self.rqs[this].lock();
            (a, b)
        }
    }
}

/// Second-earliest candidate the remote runqueue can spare: skip the
/// leftmost (the remote will run that one itself) and return the first
/// entity after it that is not running, migratable, and allowed on
/// `for_cpu`. Callers rely on the skip.
fn pick_next_earliest_dl_task(rq: &DlRq, tasks: &Tasks, for_cpu: CpuId) -> Option<(TaskId, u64)> {
    for key in rq.iter_after_leftmost() {
        if rq.is_current(key.task) {
            continue;
        }
        let Some(p) = task_ref(tasks, key.task) else {
            continue;
        };
        if p.affinity.is_set(for_cpu) && p.dl.nr_cpus_allowed > 1 {
            return Some((key.task, key.deadline));
        }
    }
    None
}
