//! Task records and the task table
//!
//! The scheduler does not own process lifecycle; it keeps exactly the
//! per-task state the deadline class needs. Back-pointers between entity,
//! task, runqueue and domain are resolved by indexing: a task id is an
//! index into this table, a CPU id is an index into the runqueue array.
//!
//! ## Lock ordering
//!
//! Runqueue locks come first (two of them in canonical CPU-index order
//! when balancing), then the task table, then the timer queue.

use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use crate::entity::DlEntity;
use crate::types::{CpuId, CpuMask, SchedClass, TaskId};

/// Per-task record for this scheduling class.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub id: TaskId,
    /// Class the task currently runs under. Bandwidth reclaiming may park
    /// a throttled deadline task in another class temporarily.
    pub class: SchedClass,
    /// The task's policy is deadline even while its class is demoted for
    /// reclaiming; cleared when the user switches it away for real.
    pub policy_deadline: bool,
    /// Real-time priority used by the `BWRECL_RT` demotion mapping.
    pub rt_priority: u8,
    /// CPU the task is (or last was) assigned to.
    pub cpu: CpuId,
    /// Runnable: between activate and deactivate. A throttled task that
    /// did not sleep keeps this set while off the ready tree.
    pub on_rq: bool,
    pub affinity: CpuMask,
    /// Start of the current execution stint on its CPU's clock.
    pub exec_start: u64,
    pub sum_exec_runtime: u64,
    /// Relative parameters of the top priority-inheritance waiter, when
    /// the task is boosted on its behalf.
    pub pi_waiter: Option<crate::types::DlParams>,
    pub dl: DlEntity,
}

impl Task {
    #[inline]
    pub fn is_dl_class(&self) -> bool {
        self.class.is_deadline()
    }

    #[inline]
    pub fn boosted(&self) -> bool {
        self.pi_waiter.is_some()
    }

    /// Parameter view for CBS decisions: the boosting waiter's relative
    /// deadline replaces the task's own when it is smaller. The ready-tree
    /// key always stays the task's own absolute deadline.
    pub fn pi_params(&self) -> crate::types::DlParams {
        match self.pi_waiter {
            Some(waiter) if waiter.deadline < self.dl.params.deadline => waiter,
            _ => self.dl.params,
        }
    }
}

/// Slot-indexed task storage behind a single lock, acquired after any
/// runqueue locks.
pub struct TaskTable {
    slots: Mutex<Vec<Option<Task>>>,
}

pub type Tasks = Vec<Option<Task>>;
pub type TasksGuard<'a> = MutexGuard<'a, Tasks>;

impl TaskTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn lock(&self) -> TasksGuard<'_> {
        self.slots.lock()
    }

    /// Insert a task, returning its id (the slot index).
    pub fn insert(&self, mut task: Task) -> TaskId {
        let mut slots = self.slots.lock();
        let id = slots.len() as TaskId;
        task.id = id;
        slots.push(Some(task));
        id
    }

    pub fn remove(&self, id: TaskId) -> Option<Task> {
        let mut slots = self.slots.lock();
        slots.get_mut(id as usize).and_then(|slot| slot.take())
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared-reference lookup; `None` for dead or never-allocated ids.
#[inline]
pub fn task_ref(tasks: &Tasks, id: TaskId) -> Option<&Task> {
    tasks.get(id as usize).and_then(|slot| slot.as_ref())
}

/// Mutable lookup.
#[inline]
pub fn task_mut(tasks: &mut Tasks, id: TaskId) -> Option<&mut Task> {
    tasks.get_mut(id as usize).and_then(|slot| slot.as_mut())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DlFlags, DlParams};

    fn task() -> Task {
        Task {
            id: 0,
            class: SchedClass::Deadline,
            policy_deadline: true,
            rt_priority: 0,
            cpu: 0,
            on_rq: false,
            affinity: CpuMask::all(),
            exec_start: 0,
            sum_exec_runtime: 0,
            pi_waiter: None,
            dl: DlEntity::new(DlParams::new(1, 2, 2), DlFlags::empty()),
        }
    }

    #[test]
    fn insert_assigns_slot_ids() {
        let table = TaskTable::new();
        let a = table.insert(task());
        let b = table.insert(task());
        assert_eq!((a, b), (0, 1));

        let slots = table.lock();
        assert_eq!(task_ref(&slots, b).unwrap().id, 1);
        assert!(task_ref(&slots, 7).is_none());
    }

    #[test]
    fn remove_frees_the_slot() {
        let table = TaskTable::new();
        let id = table.insert(task());
        assert!(table.remove(id).is_some());
        assert!(table.lock().get(id as usize).unwrap().is_none());
    }

    #[test]
    fn pi_view_prefers_smaller_relative_deadline() {
        let mut t = task();
        t.dl.params = DlParams::new(1_000, 10_000, 10_000);
        assert_eq!(t.pi_params(), t.dl.params);

        t.pi_waiter = Some(DlParams::new(1_000, 4_000, 4_000));
        assert_eq!(t.pi_params().deadline, 4_000);

        t.pi_waiter = Some(DlParams::new(1_000, 50_000, 50_000));
        assert_eq!(t.pi_params().deadline, 10_000);
    }
}
