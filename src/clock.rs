// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Time abstraction used by every primitive that refills, leaks, or times out.
//!
//! Nothing in this crate reads `Instant::now()` directly. A [`Clock`] is passed by
//! `Arc` to whichever primitive needs it, so production code runs against
//! [`SystemClock`] and tests run against [`TestClock`], which advances deterministically
//! and fires pending timers in deadline order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A handle to a scheduled [`Clock::after`] callback. Dropping or calling
/// [`TimerHandle::cancel`] prevents the callback from running if it has not fired yet.
pub struct TimerHandle {
    cancel: Arc<std::sync::atomic::AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

/// Source of monotonic time, blocking sleeps, and deferred callbacks.
///
/// Implementors must guarantee `now()` is monotonically non-decreasing and that
/// `sleep` blocks the calling thread for at least the requested duration.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Block the calling thread for `d`.
    fn sleep(&self, d: Duration);

    /// Run `f` once, after at least `d` has elapsed, on a clock-owned thread.
    /// Returns a handle that cancels the callback if it has not yet fired.
    fn after(&self, d: Duration, f: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Real-time clock backed by `std::time::Instant` and OS thread sleeps.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }

    fn after(&self, d: Duration, f: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let cancel_thread = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(d);
            if !cancel_thread.load(Ordering::SeqCst) {
                f();
            }
        });
        TimerHandle { cancel }
    }
}

struct PendingTimer {
    id: u64,
    deadline: Instant,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

struct TestClockState {
    now: Instant,
    timers: Vec<Arc<PendingTimer>>,
}

/// Deterministic clock for tests: time only moves when [`TestClock::advance`] is
/// called, and any timer whose deadline has been reached fires synchronously, in
/// deadline order, before `advance` returns.
#[derive(Clone)]
pub struct TestClock {
    state: Arc<Mutex<TestClockState>>,
    woken: Arc<Condvar>,
    next_id: Arc<AtomicU64>,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TestClockState {
                now: Instant::now(),
                timers: Vec::new(),
            })),
            woken: Arc::new(Condvar::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move the clock forward by `d`, firing every timer whose deadline has been
    /// reached, in deadline order.
    pub fn advance(&self, d: Duration) {
        let mut due = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.now += d;
            let now = state.now;
            state.timers.retain(|t| {
                if t.cancelled.load(Ordering::SeqCst) {
                    return false;
                }
                if t.deadline <= now {
                    due.push(t.clone());
                    false
                } else {
                    true
                }
            });
        }
        due.sort_by_key(|t| (t.deadline, t.id));
        for t in due {
            if let Some(cb) = t.callback.lock().unwrap().take() {
                cb();
            }
        }
        self.woken.notify_all();
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.state.lock().unwrap().now
    }

    /// Blocks the calling thread until some other thread calls [`TestClock::advance`]
    /// past `self.now() + d`. Intended only for tests exercising real threads against
    /// a clock another thread drives explicitly.
    fn sleep(&self, d: Duration) {
        let deadline = self.now() + d;
        let guard = self.state.lock().unwrap();
        let _unused = self
            .woken
            .wait_while(guard, |s| s.now < deadline)
            .unwrap();
    }

    fn after(&self, d: Duration, f: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut state = self.state.lock().unwrap();
        let deadline = state.now + d;
        state.timers.push(Arc::new(PendingTimer {
            id,
            deadline,
            callback: Mutex::new(Some(f)),
            cancelled: cancelled.clone(),
        }));
        TimerHandle { cancel: cancelled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn advance_fires_due_timers_in_deadline_order() {
        let clock = TestClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        clock.after(Duration::from_millis(30), Box::new(move || o1.lock().unwrap().push(30)));
        let o2 = order.clone();
        clock.after(Duration::from_millis(10), Box::new(move || o2.lock().unwrap().push(10)));
        let o3 = order.clone();
        clock.after(Duration::from_millis(20), Box::new(move || o3.lock().unwrap().push(20)));

        clock.advance(Duration::from_millis(25));
        assert_eq!(*order.lock().unwrap(), vec![10, 20]);

        clock.advance(Duration::from_millis(10));
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let clock = TestClock::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = clock.after(Duration::from_millis(10), Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        handle.cancel();
        clock.advance(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn now_is_monotonic_under_advance() {
        let clock = TestClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_millis(5));
        assert!(clock.now() >= t0 + Duration::from_millis(5));
    }
}
