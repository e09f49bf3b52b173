//! Per-CPU deadline runqueue
//!
//! Each CPU owns one `DlRq`: an ordered set of runnable deadline entities
//! keyed by absolute deadline (HEAD entities first), a cached leftmost for
//! O(1) EDF picking, the earliest/second-earliest deadlines consulted by
//! the balancing heuristics, and the pushable tree of migratable
//! not-running tasks.
//!
//! The inner state lives behind a `spin::Mutex`; the outer `Rq` also
//! publishes lock-free snapshots of the fields remote CPUs read while
//! hunting for placement targets, so those scans never take a foreign
//! lock. The snapshots are deliberately racy; every decision based on them
//! is re-verified under the real lock.

use alloc::collections::BTreeSet;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use crate::domain::RootDomain;
use crate::stats::DlRqStats;
use crate::types::{CpuId, RqKey, TaskId};

/// Earliest and second-earliest absolute deadlines on a runqueue;
/// 0 is the "none" sentinel.
#[derive(Debug, Clone, Copy, Default)]
pub struct EarliestDl {
    pub curr: u64,
    pub next: u64,
}

/// Deadline-class state of one CPU, protected by that CPU's lock.
pub struct DlRq {
    pub cpu: CpuId,
    /// Runqueue clock, monotonic nanoseconds, advanced by the core.
    pub clock: u64,
    pub online: bool,
    /// Task currently running on this CPU, whatever its class.
    pub curr: Option<TaskId>,
    /// Reschedule latch for the core.
    pub resched: bool,
    tree: BTreeSet<RqKey>,
    leftmost: Option<RqKey>,
    pub nr_running: usize,
    /// Ready entities allowed on more than one CPU.
    pub nr_migratory: usize,
    pub overloaded: bool,
    pub earliest: EarliestDl,
    pushable: BTreeSet<RqKey>,
    pushable_leftmost: Option<RqKey>,
    pub stats: DlRqStats,
}

impl DlRq {
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            clock: 0,
            online: true,
            curr: None,
            resched: false,
            tree: BTreeSet::new(),
            leftmost: None,
            nr_running: 0,
            nr_migratory: 0,
            overloaded: false,
            earliest: EarliestDl::default(),
            pushable: BTreeSet::new(),
            pushable_leftmost: None,
            stats: DlRqStats::default(),
        }
    }

    #[inline]
    pub fn is_current(&self, task: TaskId) -> bool {
        self.curr == Some(task)
    }

    #[inline]
    pub fn leftmost(&self) -> Option<RqKey> {
        self.leftmost
    }

    #[inline]
    pub fn has_ready(&self) -> bool {
        self.nr_running != 0
    }

    /// Ready entities in EDF order, skipping the leftmost. The pull path
    /// scans this to find the second-earliest candidate it may steal.
    pub fn iter_after_leftmost(&self) -> impl Iterator<Item = &RqKey> {
        self.tree.iter().skip(1)
    }

    /// Admit an entity to the ready tree and keep every derived field in
    /// step: leftmost, earliest pair, counts, overload state.
    pub fn insert_entity(&mut self, key: RqKey, migratory: bool, rd: &RootDomain) {
        debug_assert!(!self.tree.contains(&key));

        self.tree.insert(key);
        self.nr_running += 1;
        if migratory {
            self.nr_migratory += 1;
        }
        self.refresh_earliest();
        self.update_overload(rd);
    }

    /// Remove an entity from the ready tree; the mirror of
    /// `insert_entity`.
    pub fn remove_entity(&mut self, key: RqKey, migratory: bool, rd: &RootDomain) {
        let removed = self.tree.remove(&key);
        debug_assert!(removed);
        if !removed {
            return;
        }

        self.nr_running -= 1;
        if migratory {
            debug_assert!(self.nr_migratory > 0);
            self.nr_migratory = self.nr_migratory.saturating_sub(1);
        }
        self.refresh_earliest();
        self.update_overload(rd);
    }

    /// A queued entity's affinity cardinality crossed the migratable
    /// boundary; fix the count and the overload state.
    pub fn migratory_changed(&mut self, was: bool, now: bool, rd: &RootDomain) {
        match (was, now) {
            (false, true) => self.nr_migratory += 1,
            (true, false) => {
                debug_assert!(self.nr_migratory > 0);
                self.nr_migratory = self.nr_migratory.saturating_sub(1);
            }
            _ => return,
        }
        self.update_overload(rd);
    }

    fn refresh_earliest(&mut self) {
        let mut iter = self.tree.iter();
        self.leftmost = iter.next().copied();
        self.earliest.curr = self.leftmost.map_or(0, |key| key.deadline);
        self.earliest.next = iter.next().map_or(0, |key| key.deadline);
    }

    /// Overloaded iff at least two ready deadline tasks and at least one
    /// of them can move. The domain bit is only published while the
    /// runqueue is online; `rq_online`/`rq_offline` replay it.
    fn update_overload(&mut self, rd: &RootDomain) {
        let overloaded = self.nr_migratory >= 1 && self.nr_running >= 2;

        if overloaded && !self.overloaded {
            if self.online {
                rd.set_overload(self.cpu);
            }
            self.overloaded = true;
        } else if !overloaded && self.overloaded {
            if self.online {
                rd.clear_overload(self.cpu);
            }
            self.overloaded = false;
        }
    }

    pub fn pushable_insert(&mut self, key: RqKey) {
        self.pushable.insert(key);
        self.pushable_leftmost = self.pushable.iter().next().copied();
    }

    pub fn pushable_remove(&mut self, key: RqKey) {
        self.pushable.remove(&key);
        self.pushable_leftmost = self.pushable.iter().next().copied();
    }

    #[inline]
    pub fn pushable_leftmost(&self) -> Option<RqKey> {
        self.pushable_leftmost
    }

    #[inline]
    pub fn has_pushable(&self) -> bool {
        !self.pushable.is_empty()
    }
}

/// One CPU's runqueue: the locked state plus racy snapshots for remote
/// placement scans.
pub struct Rq {
    pub cpu: CpuId,
    inner: Mutex<DlRq>,
    earliest_curr: AtomicU64,
    earliest_next: AtomicU64,
    nr_running: AtomicUsize,
}

impl Rq {
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            inner: Mutex::new(DlRq::new(cpu)),
            earliest_curr: AtomicU64::new(0),
            earliest_next: AtomicU64::new(0),
            nr_running: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, DlRq> {
        self.inner.lock()
    }

    /// Refresh the lock-free mirror from the locked state; call before
    /// dropping a guard that may have changed the tree.
    pub fn publish(&self, rq: &DlRq) {
        self.earliest_curr
            .store(rq.earliest.curr, Ordering::Release);
        self.earliest_next
            .store(rq.earliest.next, Ordering::Release);
        self.nr_running.store(rq.nr_running, Ordering::Release);
    }

    #[inline]
    pub fn snapshot_earliest(&self) -> u64 {
        self.earliest_curr.load(Ordering::Acquire)
    }

    #[inline]
    pub fn snapshot_earliest_next(&self) -> u64 {
        self.earliest_next.load(Ordering::Acquire)
    }

    #[inline]
    pub fn snapshot_nr_running(&self) -> usize {
        self.nr_running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CpuMask;

    fn key(deadline: u64, task: TaskId) -> RqKey {
        RqKey {
            head: false,
            deadline,
            task,
        }
    }

    fn domain() -> RootDomain {
        RootDomain::new(CpuMask::first_n(2))
    }

    #[test]
    fn leftmost_and_earliest_track_the_tree() {
        let rd = domain();
        let mut rq = DlRq::new(0);

        rq.insert_entity(key(30, 1), false, &rd);
        assert_eq!(rq.leftmost(), Some(key(30, 1)));
        assert_eq!(rq.earliest.curr, 30);
        assert_eq!(rq.earliest.next, 0);

        rq.insert_entity(key(10, 2), false, &rd);
        assert_eq!(rq.leftmost(), Some(key(10, 2)));
        assert_eq!(rq.earliest.curr, 10);
        assert_eq!(rq.earliest.next, 30);

        rq.insert_entity(key(20, 3), false, &rd);
        assert_eq!(rq.earliest.next, 20);

        rq.remove_entity(key(10, 2), false, &rd);
        assert_eq!(rq.leftmost(), Some(key(20, 3)));
        assert_eq!(rq.earliest.curr, 20);
        assert_eq!(rq.earliest.next, 30);

        rq.remove_entity(key(20, 3), false, &rd);
        rq.remove_entity(key(30, 1), false, &rd);
        assert_eq!(rq.earliest.curr, 0);
        assert_eq!(rq.earliest.next, 0);
        assert!(!rq.has_ready());
    }

    #[test]
    fn head_entity_is_always_leftmost() {
        let rd = domain();
        let mut rq = DlRq::new(0);

        rq.insert_entity(key(10, 1), false, &rd);
        let head = RqKey {
            head: true,
            deadline: 500,
            task: 2,
        };
        rq.insert_entity(head, false, &rd);
        assert_eq!(rq.leftmost(), Some(head));
        assert_eq!(rq.earliest.curr, 500);
    }

    #[test]
    fn overload_needs_two_ready_and_one_migratory() {
        let rd = domain();
        let mut rq = DlRq::new(0);

        rq.insert_entity(key(10, 1), true, &rd);
        assert!(!rq.overloaded);
        assert!(!rd.overloaded());

        rq.insert_entity(key(20, 2), false, &rd);
        assert!(rq.overloaded);
        assert!(rd.overload_mask().is_set(0));

        rq.remove_entity(key(10, 1), true, &rd);
        assert!(!rq.overloaded);
        assert!(!rd.overloaded());
    }

    #[test]
    fn migratory_transition_updates_overload() {
        let rd = domain();
        let mut rq = DlRq::new(0);

        rq.insert_entity(key(10, 1), false, &rd);
        rq.insert_entity(key(20, 2), false, &rd);
        assert!(!rq.overloaded);

        // Task 1's affinity widened past one CPU.
        rq.migratory_changed(false, true, &rd);
        assert!(rq.overloaded);

        rq.migratory_changed(true, false, &rd);
        assert!(!rq.overloaded);
    }

    #[test]
    fn offline_rq_keeps_bit_out_of_the_domain() {
        let rd = domain();
        let mut rq = DlRq::new(0);
        rq.online = false;

        rq.insert_entity(key(10, 1), true, &rd);
        rq.insert_entity(key(20, 2), true, &rd);
        assert!(rq.overloaded);
        assert!(!rd.overloaded());
    }

    #[test]
    fn pushable_leftmost_follows_min() {
        let mut rq = DlRq::new(0);
        rq.pushable_insert(key(40, 1));
        rq.pushable_insert(key(15, 2));
        assert_eq!(rq.pushable_leftmost(), Some(key(15, 2)));
        rq.pushable_remove(key(15, 2));
        assert_eq!(rq.pushable_leftmost(), Some(key(40, 1)));
        rq.pushable_remove(key(40, 1));
        assert!(!rq.has_pushable());
    }

    #[test]
    fn iter_after_leftmost_skips_the_minimum() {
        let rd = domain();
        let mut rq = DlRq::new(0);
        rq.insert_entity(key(10, 1), false, &rd);
        rq.insert_entity(key(20, 2), false, &rd);
        rq.insert_entity(key(30, 3), false, &rd);

        let rest: alloc::vec::Vec<u64> =
            rq.iter_after_leftmost().map(|k| k.deadline).collect();
        assert_eq!(rest, [20, 30]);
    }
}
