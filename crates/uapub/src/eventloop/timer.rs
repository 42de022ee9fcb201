// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binary-heap timer queue.
//!
//! Stale heap entries (from `modify_timer` re-basing) are detected by
//! comparing the popped deadline with the live record; only matching entries
//! fire. Callbacks are invoked with the queue lock released so they may add,
//! modify or remove timers, including their own.

use super::{TimerCallback, TimerId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

pub(super) struct TimerRecord {
    pub interval: Duration,
    pub next: Instant,
    /// Taken out while the callback runs.
    pub callback: Option<TimerCallback>,
}

#[derive(Default)]
pub(super) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    timers: HashMap<TimerId, TimerRecord>,
}

impl TimerQueue {
    pub fn insert(&mut self, id: TimerId, interval: Duration, callback: TimerCallback) {
        let next = Instant::now() + interval;
        self.timers.insert(id, TimerRecord { interval, next, callback: Some(callback) });
        self.heap.push(Reverse((next, id)));
    }

    pub fn rebase(&mut self, id: TimerId, interval: Duration) -> bool {
        let Some(rec) = self.timers.get_mut(&id) else {
            return false;
        };
        rec.interval = interval;
        rec.next = Instant::now() + interval;
        self.heap.push(Reverse((rec.next, id)));
        true
    }

    pub fn remove(&mut self, id: TimerId) {
        self.timers.remove(&id);
    }

    /// Deadline of the earliest live timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            match self.timers.get(&id) {
                Some(rec) if rec.next == deadline => return Some(deadline),
                // stale entry from rebase or removal
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pop one due timer, handing out its callback. The caller invokes the
    /// callback without the lock and then calls [`Self::restore`].
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, TimerCallback)> {
        loop {
            let Reverse((deadline, id)) = self.heap.peek().copied()?;
            if deadline > now {
                return None;
            }
            self.heap.pop();
            let Some(rec) = self.timers.get_mut(&id) else {
                continue; // removed, stale entry
            };
            if rec.next != deadline {
                continue; // rebased, stale entry
            }
            let Some(cb) = rec.callback.take() else {
                continue; // already firing (cannot happen single-threaded)
            };
            return Some((id, cb));
        }
    }

    /// Re-arm a timer after its callback ran. If the callback removed the
    /// timer the record is gone and the callback is dropped.
    pub fn restore(&mut self, id: TimerId, callback: TimerCallback) {
        let Some(rec) = self.timers.get_mut(&id) else {
            return;
        };
        if rec.callback.is_none() {
            rec.callback = Some(callback);
            // modify_timer from within the callback already pushed a fresh
            // heap entry; re-arming again would double-fire
            if rec.next <= Instant::now() {
                rec.next = Instant::now() + rec.interval;
                self.heap.push(Reverse((rec.next, id)));
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_due_and_restore_cycle() {
        let mut q = TimerQueue::default();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        q.insert(1, Duration::from_millis(0), Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        let (id, mut cb) = q.pop_due(Instant::now() + Duration::from_millis(1)).expect("due");
        assert_eq!(id, 1);
        cb();
        q.restore(id, cb);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(q.len(), 1);
        assert!(q.next_deadline().is_some());
    }

    #[test]
    fn test_remove_drops_stale_heap_entries() {
        let mut q = TimerQueue::default();
        q.insert(7, Duration::from_millis(5), Box::new(|| {}));
        q.remove(7);
        assert!(q.next_deadline().is_none());
        assert!(q.pop_due(Instant::now() + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_rebase_moves_deadline() {
        let mut q = TimerQueue::default();
        q.insert(3, Duration::from_millis(1), Box::new(|| {}));
        assert!(q.rebase(3, Duration::from_secs(3600)));
        // old deadline is stale; nothing fires now
        assert!(q.pop_due(Instant::now() + Duration::from_millis(50)).is_none());
        assert!(!q.rebase(99, Duration::from_millis(1)));
    }
}
