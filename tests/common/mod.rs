//! Test driver emulating the generic scheduler core.
//!
//! The crate under test only implements the deadline class; this module
//! plays the part of the surrounding kernel: it advances runqueue clocks,
//! fires the timer subsystem, delivers wakeups through the placement hook,
//! ticks the running tasks, and performs the put/pre/pick/post schedule
//! dance whenever a reschedule is latched.
//!
//! Workloads are modelled per task: `Busy` tasks always want the CPU,
//! `Periodic` tasks release a job of fixed work every period and block
//! until the next release once it completes.

// Each integration binary compiles its own copy and uses a subset.
#![allow(dead_code)]

use dlsched::{
    BalanceFlag, CpuId, CpuMask, DlFlags, DlParams, DlScheduler, EnqueueFlags, SchedClass, TaskId,
};

pub const MS: u64 = 1_000_000;

/// Simulation step: 100 microseconds.
pub const DT: u64 = 100_000;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Never blocks; models a CPU hog (possibly far beyond its budget).
    Busy,
    /// Releases `work` ns of computation every `period` ns, blocking
    /// between a job's completion and the next release.
    Periodic { work: u64, period: u64 },
}

pub struct SimTask {
    pub id: TaskId,
    behavior: Behavior,
    /// Relative deadline used for miss accounting.
    rel_deadline: u64,
    phase: u64,
    sleeping: bool,
    wake_at: u64,
    job_left: u64,
    release_time: u64,
    releases: u64,
    /// Sleep via `wait_interval` instead of plain next-release arithmetic.
    use_wait_interval: bool,
    pub total_exec: u64,
    pub wakes: Vec<u64>,
    /// (completion instant, met its absolute deadline).
    pub completions: Vec<(u64, bool)>,
}

pub struct Sim {
    pub sched: DlScheduler,
    pub now: u64,
    nr_cpus: usize,
    tasks: Vec<SimTask>,
}

impl Sim {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            sched: DlScheduler::new(nr_cpus),
            now: 0,
            nr_cpus,
            tasks: Vec::new(),
        }
    }

    /// Install a busy task and enqueue it immediately on `cpu`.
    pub fn add_busy(&mut self, params: DlParams, affinity: CpuMask, cpu: CpuId) -> TaskId {
        self.add_busy_with_flags(params, affinity, cpu, DlFlags::empty())
    }

    pub fn add_busy_with_flags(
        &mut self,
        params: DlParams,
        affinity: CpuMask,
        cpu: CpuId,
        flags: DlFlags,
    ) -> TaskId {
        let id = self
            .sched
            .task_create_with_flags(params, affinity, flags)
            .expect("valid parameters");
        self.sched.set_task_cpu(id, cpu);
        self.sched.enqueue_task(cpu, id, EnqueueFlags::WAKEUP);
        self.sched.check_preempt_curr(cpu, id);
        self.tasks.push(SimTask {
            id,
            behavior: Behavior::Busy,
            rel_deadline: params.deadline,
            phase: self.now,
            sleeping: false,
            wake_at: 0,
            job_left: u64::MAX,
            release_time: self.now,
            releases: 1,
            use_wait_interval: false,
            total_exec: 0,
            wakes: Vec::new(),
            completions: Vec::new(),
        });
        id
    }

    /// Install a periodic task; its first release happens at `phase`.
    pub fn add_periodic(
        &mut self,
        params: DlParams,
        affinity: CpuMask,
        cpu: CpuId,
        work: u64,
        phase: u64,
    ) -> TaskId {
        self.add_periodic_inner(params, affinity, cpu, work, phase, false)
    }

    /// Periodic task that sleeps via `wait_interval` after each job.
    pub fn add_periodic_wait_interval(
        &mut self,
        params: DlParams,
        affinity: CpuMask,
        cpu: CpuId,
        work: u64,
        phase: u64,
    ) -> TaskId {
        self.add_periodic_inner(params, affinity, cpu, work, phase, true)
    }

    fn add_periodic_inner(
        &mut self,
        params: DlParams,
        affinity: CpuMask,
        cpu: CpuId,
        work: u64,
        phase: u64,
        use_wait_interval: bool,
    ) -> TaskId {
        let id = self
            .sched
            .task_create(params, affinity)
            .expect("valid parameters");
        self.sched.set_task_cpu(id, cpu);
        self.tasks.push(SimTask {
            id,
            behavior: Behavior::Periodic {
                work,
                period: params.period,
            },
            rel_deadline: params.deadline,
            phase,
            sleeping: true,
            wake_at: phase,
            job_left: 0,
            release_time: phase,
            releases: 0,
            use_wait_interval,
            total_exec: 0,
            wakes: Vec::new(),
            completions: Vec::new(),
        });
        id
    }

    pub fn run_until(&mut self, t_end: u64) {
        while self.now < t_end {
            self.step();
        }
    }

    pub fn step(&mut self) {
        // Whoever is current now has been running since the last step.
        let running: Vec<Option<TaskId>> =
            (0..self.nr_cpus).map(|cpu| self.sched.current(cpu)).collect();

        self.now += DT;
        for cpu in 0..self.nr_cpus {
            self.sched.update_rq_clock(cpu, self.now);
        }

        self.sched.run_timers(self.now);
        self.deliver_wakeups();

        for cpu in 0..self.nr_cpus {
            if let Some(curr) = self.sched.current(cpu) {
                if self.is_dl_policy(curr) {
                    self.sched.task_tick(cpu, curr, true);
                }
            }
        }

        self.charge_work(&running);

        for cpu in 0..self.nr_cpus {
            self.maybe_schedule(cpu);
        }
    }

    fn deliver_wakeups(&mut self) {
        let now = self.now;
        for idx in 0..self.tasks.len() {
            let (id, work) = {
                let st = &self.tasks[idx];
                if !st.sleeping || st.wake_at > now {
                    continue;
                }
                let work = match st.behavior {
                    Behavior::Periodic { work, .. } => work,
                    Behavior::Busy => u64::MAX,
                };
                (st.id, work)
            };

            let cpu = self.sched.select_task_rq(id, BalanceFlag::Wake);
            self.sched.enqueue_task(cpu, id, EnqueueFlags::WAKEUP);
            self.sched.check_preempt_curr(cpu, id);
            self.sched.task_woken(cpu, id);

            let st = &mut self.tasks[idx];
            st.sleeping = false;
            st.job_left = work;
            st.release_time = st.wake_at;
            st.releases += 1;
            st.wakes.push(now);
        }
    }

    fn charge_work(&mut self, running: &[Option<TaskId>]) {
        for &curr in running.iter() {
            let Some(id) = curr else { continue };
            let Some(idx) = self.tasks.iter().position(|t| t.id == id) else {
                continue;
            };
            if self.tasks[idx].sleeping {
                continue;
            }

            let now = self.now;
            let st = &mut self.tasks[idx];
            st.total_exec += DT;

            if let Behavior::Periodic { period, .. } = st.behavior {
                st.job_left = st.job_left.saturating_sub(DT);
                if st.job_left == 0 {
                    let met = now <= st.release_time + st.rel_deadline;
                    st.completions.push((now, met));

                    let next_release = st.phase + st.releases * period;
                    let use_wi = st.use_wait_interval;

                    let wake_at = if use_wi {
                        self.sched.wait_interval(id, None)
                    } else {
                        next_release
                    };

                    let cpu = self
                        .sched
                        .task_snapshot(id)
                        .map(|p| p.cpu)
                        .unwrap_or(0);
                    self.sched.dequeue_task(cpu, id, EnqueueFlags::empty());

                    let st = &mut self.tasks[idx];
                    st.sleeping = true;
                    st.wake_at = wake_at;
                }
            }
        }
    }

    fn maybe_schedule(&mut self, cpu: CpuId) {
        let curr = self.sched.current(cpu);
        let resched = self.sched.take_resched(cpu);
        let curr_valid = curr.is_some_and(|t| {
            self.sched
                .task_snapshot(t)
                .is_some_and(|p| p.on_rq && !p.dl.throttled && p.class == SchedClass::Deadline)
        });

        if !resched && curr_valid {
            return;
        }

        if let Some(prev) = curr {
            if self.is_dl_class(prev) {
                self.sched.put_prev_task(cpu, prev);
                self.sched.pre_schedule(cpu, prev);
            }
        }

        let next = self.sched.pick_next_task(cpu);
        self.sched.set_current(cpu, next);
        self.sched.post_schedule(cpu);
    }

    fn is_dl_policy(&self, id: TaskId) -> bool {
        self.sched
            .task_snapshot(id)
            .is_some_and(|p| p.policy_deadline)
    }

    fn is_dl_class(&self, id: TaskId) -> bool {
        self.sched
            .task_snapshot(id)
            .is_some_and(|p| p.class == SchedClass::Deadline)
    }

    pub fn task(&self, id: TaskId) -> &SimTask {
        self.tasks.iter().find(|t| t.id == id).expect("known task")
    }

    pub fn exec_time(&self, id: TaskId) -> u64 {
        self.task(id).total_exec
    }

    pub fn completions(&self, id: TaskId) -> &[(u64, bool)] {
        &self.task(id).completions
    }

    pub fn missed_deadlines(&self, id: TaskId) -> usize {
        self.task(id).completions.iter().filter(|(_, met)| !met).count()
    }

    pub fn wakes(&self, id: TaskId) -> &[u64] {
        &self.task(id).wakes
    }
}
