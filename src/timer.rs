//! Replenishment timer queue
//!
//! Every throttled entity owns one one-shot timer aimed at its
//! replenishment instant, absolute monotonic time. The embedder drives
//! firing: it tells the scheduler how far the timer clock has advanced and
//! the scheduler delivers the due callbacks, each taking its target
//! runqueue lock itself. The timer clock may be skewed from the runqueue
//! clocks; arming compensates for the difference.
//!
//! The queue lock is the innermost lock in the crate: it is taken with
//! runqueue and task locks held (arming from the throttle path) and alone
//! (synchronous cancellation on task death, which must happen without any
//! runqueue lock held because callbacks take one).

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use spin::Mutex;

use crate::types::TaskId;

struct TimerInner {
    /// Armed timers keyed by (absolute expiry, task).
    queue: BTreeSet<(u64, TaskId)>,
    /// Timer-subsystem clock, monotonic nanoseconds.
    now: u64,
}

pub struct TimerQueue {
    inner: Mutex<TimerInner>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimerInner {
                queue: BTreeSet::new(),
                now: 0,
            }),
        }
    }

    /// Current timer-subsystem time.
    pub fn now(&self) -> u64 {
        self.inner.lock().now
    }

    /// Arm a one-shot timer. Returns false without arming when the expiry
    /// has already passed; the caller replenishes immediately instead.
    pub fn start(&self, expires: u64, task: TaskId) -> bool {
        let mut inner = self.inner.lock();
        if (expires.wrapping_sub(inner.now) as i64) < 0 {
            return false;
        }
        inner.queue.insert((expires, task));
        true
    }

    /// Synchronously cancel `task`'s timer, if armed. With firing driven
    /// from `take_due` under this same lock, a cancelled timer is
    /// guaranteed not to deliver afterwards.
    pub fn cancel(&self, expires: u64, task: TaskId) {
        self.inner.lock().queue.remove(&(expires, task));
    }

    /// Advance the timer clock and collect every timer due at or before
    /// it, in firing order.
    pub fn take_due(&self, now: u64) -> Vec<(u64, TaskId)> {
        let mut inner = self.inner.lock();
        if (inner.now.wrapping_sub(now) as i64) < 0 {
            inner.now = now;
        }
        let now = inner.now;

        let mut due = Vec::new();
        while let Some(&(expires, task)) = inner.queue.iter().next() {
            if (expires.wrapping_sub(now) as i64) > 0 {
                break;
            }
            inner.queue.remove(&(expires, task));
            due.push((expires, task));
        }
        due
    }

    #[cfg(test)]
    pub fn armed(&self, task: TaskId) -> bool {
        self.inner.lock().queue.iter().any(|&(_, t)| t == task)
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}
