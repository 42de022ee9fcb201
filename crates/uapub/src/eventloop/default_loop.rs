// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded event loop: timers + delayed callbacks + transport I/O.
//!
//! One thread calls [`DefaultEventLoop::run_iterate`] in a loop. Registered
//! connection managers get the remaining wait budget for their own readiness
//! polling; timer callbacks and transport callbacks therefore never run
//! concurrently.

use super::timer::TimerQueue;
use super::{DelayedCallback, EventLoop, TimerCallback, TimerId, TimerPolicy};
use crate::transport::ConnectionManager;
use crate::types::{DateTime, StatusCode};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct DefaultEventLoop {
    queue: Mutex<TimerQueue>,
    delayed: Mutex<Vec<DelayedCallback>>,
    next_id: AtomicU64,
    start: Instant,
    managers: Mutex<Vec<Arc<dyn ConnectionManager>>>,
}

impl Default for DefaultEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultEventLoop {
    #[must_use]
    pub fn new() -> Self {
        DefaultEventLoop {
            queue: Mutex::new(TimerQueue::default()),
            delayed: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            start: Instant::now(),
            managers: Mutex::new(Vec::new()),
        }
    }

    /// Attach a connection manager. Its `process_events` runs every iteration.
    pub fn register_connection_manager(&self, cm: Arc<dyn ConnectionManager>) {
        self.managers.lock().push(cm);
    }

    /// Look up an attached connection manager by protocol name ("udp", ...).
    #[must_use]
    pub fn connection_manager(&self, protocol: &str) -> Option<Arc<dyn ConnectionManager>> {
        self.managers.lock().iter().find(|cm| cm.protocol() == protocol).cloned()
    }

    fn fire_due_timers(&self) {
        loop {
            let popped = self.queue.lock().pop_due(Instant::now());
            let Some((id, mut cb)) = popped else { break };
            cb();
            self.queue.lock().restore(id, cb);
        }
    }

    fn run_delayed(&self) {
        let pending = std::mem::take(&mut *self.delayed.lock());
        for cb in pending {
            cb();
        }
    }

    /// Run one loop iteration: delayed callbacks, due timers, transport I/O.
    ///
    /// Blocks at most `max_wait` (shortened to the next timer deadline).
    pub fn run_iterate(&self, max_wait: Duration) {
        self.run_delayed();
        self.fire_due_timers();

        let now = Instant::now();
        let mut wait = max_wait;
        if let Some(deadline) = self.queue.lock().next_deadline() {
            wait = wait.min(deadline.saturating_duration_since(now));
        }

        let managers: Vec<Arc<dyn ConnectionManager>> = self.managers.lock().clone();
        if managers.is_empty() {
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        } else {
            // The first manager gets the blocking budget, the rest are polled.
            for (i, cm) in managers.iter().enumerate() {
                cm.process_events(if i == 0 { wait } else { Duration::ZERO });
            }
        }

        self.fire_due_timers();
        self.run_delayed();
    }

    /// Iterate until `deadline` or until `done` returns true.
    pub fn run_until(&self, deadline: Duration, mut done: impl FnMut() -> bool) {
        let end = Instant::now() + deadline;
        while Instant::now() < end && !done() {
            let left = end.saturating_duration_since(Instant::now());
            self.run_iterate(left.min(Duration::from_millis(5)));
        }
    }
}

impl EventLoop for DefaultEventLoop {
    fn add_timer(&self, interval_ms: f64, callback: TimerCallback) -> crate::Result<TimerId> {
        if !interval_ms.is_finite() || interval_ms < 0.0 {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let interval = Duration::from_secs_f64(interval_ms / 1000.0);
        self.queue.lock().insert(id, interval, callback);
        Ok(id)
    }

    fn modify_timer(&self, id: TimerId, interval_ms: f64, _policy: TimerPolicy) -> crate::Result<()> {
        if !interval_ms.is_finite() || interval_ms < 0.0 {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        let interval = Duration::from_secs_f64(interval_ms / 1000.0);
        if self.queue.lock().rebase(id, interval) {
            Ok(())
        } else {
            Err(StatusCode::BAD_NOT_FOUND)
        }
    }

    fn remove_timer(&self, id: TimerId) {
        self.queue.lock().remove(id);
    }

    fn add_delayed_callback(&self, callback: DelayedCallback) {
        self.delayed.lock().push(callback);
    }

    fn date_time_now(&self) -> DateTime {
        DateTime::now()
    }

    fn now_monotonic(&self) -> i64 {
        (self.start.elapsed().as_nanos() / 100) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_periodic_timer_fires() {
        let el = DefaultEventLoop::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let id = el
            .add_timer(1.0, Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("add_timer");
        assert_ne!(id, 0);

        el.run_until(Duration::from_millis(200), || count.load(Ordering::SeqCst) >= 3);
        assert!(count.load(Ordering::SeqCst) >= 3);

        el.remove_timer(id);
        let frozen = count.load(Ordering::SeqCst);
        el.run_iterate(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), frozen);
    }

    #[test]
    fn test_delayed_callback_runs_once() {
        let el = DefaultEventLoop::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        el.add_delayed_callback(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        el.run_iterate(Duration::ZERO);
        el.run_iterate(Duration::ZERO);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let el = DefaultEventLoop::new();
        let a = el.now_monotonic();
        std::thread::sleep(Duration::from_millis(2));
        assert!(el.now_monotonic() > a);
    }

    #[test]
    fn test_bad_interval_rejected() {
        let el = DefaultEventLoop::new();
        assert!(el.add_timer(f64::NAN, Box::new(|| {})).is_err());
        assert!(el.modify_timer(1234, 10.0, TimerPolicy::CurrentTime).is_err());
    }
}
