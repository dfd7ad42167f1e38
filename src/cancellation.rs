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

//! Cooperative cancellation token shared by every blocking call in this crate.
//!
//! A token is cancelled at most once (`cause` latches on the first transition), a
//! child token inherits its parent's cancellation, and a deadline-bearing token
//! cancels itself with [`Cause::DeadlineExceeded`] when a background timer (driven by
//! the injected [`Clock`]) fires. See `SPEC_FULL.md` §4.1.

use crate::clock::{Clock, TimerHandle};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Why a token transitioned to cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    UserCancelled,
    DeadlineExceeded,
}

struct State {
    cancelled: bool,
    cause: Option<Cause>,
    next_callback_id: u64,
    callbacks: std::collections::HashMap<u64, Box<dyn FnOnce(Cause) + Send>>,
}

struct Inner {
    state: Mutex<State>,
    condvar: Condvar,
    // Kept alive only so the deadline timer is cancelled when the last clone drops.
    deadline_timer: Mutex<Option<TimerHandle>>,
}

/// A cooperative, one-way cancellation signal.
///
/// Cheap to clone (an `Arc` around the shared state); every clone observes the same
/// cancellation.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// A token that never cancels on its own.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State { cancelled: false, cause: None, next_callback_id: 0, callbacks: std::collections::HashMap::new() }),
                condvar: Condvar::new(),
                deadline_timer: Mutex::new(None),
            }),
        }
    }

    /// A token that cancels itself with [`Cause::DeadlineExceeded`] once `clock.now()
    /// + timeout` is reached.
    pub fn with_deadline(clock: &dyn Clock, timeout: Duration) -> Self {
        let token = Self::new();
        let inner = token.inner.clone();
        let handle = clock.after(
            timeout,
            Box::new(move || {
                Self::fire(&inner, Cause::DeadlineExceeded);
            }),
        );
        *token.inner.deadline_timer.lock().unwrap() = Some(handle);
        token
    }

    /// A child token: cancelled whenever `self` cancels (with the same cause),
    /// independently cancellable on its own before that happens.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        let child_inner = child.inner.clone();
        self.on_cancel(move |cause| Self::fire(&child_inner, cause));
        child
    }

    /// A token cancelled as soon as *either* `a` or `b` cancels, with whichever
    /// cause fired first. Used by the worker pool to build a submission's effective
    /// token from the caller's token and the pool's base token.
    ///
    /// Returns the combined token together with an [`AnyOfGuard`]. The guard
    /// deregisters the linkage from `a` and `b` when dropped; hold it for exactly as
    /// long as the combined token is in use, then drop it. Without this, a
    /// registration against a long-lived token (e.g. a pool's base token, linked once
    /// per submitted task) would accumulate one callback per call forever.
    #[must_use]
    pub fn any_of(a: &Self, b: &Self) -> (Self, AnyOfGuard) {
        let combined = Self::new();
        let c1 = combined.inner.clone();
        let id_a = a.on_cancel_removable(move |cause| Self::fire(&c1, cause));
        let c2 = combined.inner.clone();
        let id_b = b.on_cancel_removable(move |cause| Self::fire(&c2, cause));
        let guard = AnyOfGuard { a: a.clone(), id_a, b: b.clone(), id_b };
        (combined, guard)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().unwrap().cancelled
    }

    pub fn cause(&self) -> Option<Cause> {
        self.inner.state.lock().unwrap().cause
    }

    /// Cancel with [`Cause::UserCancelled`]. Idempotent: a second call is a no-op.
    pub fn cancel(&self) {
        Self::fire(&self.inner, Cause::UserCancelled);
    }

    /// Block until cancelled.
    pub fn wait_cancelled(&self) -> Cause {
        let guard = self.inner.state.lock().unwrap();
        let guard = self.inner.condvar.wait_while(guard, |s| !s.cancelled).unwrap();
        guard.cause.expect("cancelled state always carries a cause")
    }

    /// Block until cancelled or `d` elapses, whichever first. Returns the cause if
    /// cancelled within `d`, `None` on timeout. Used internally by the rate limiters
    /// and the semaphore to sleep-with-cancellation.
    pub fn wait_cancelled_for(&self, d: Duration) -> Option<Cause> {
        let deadline = Instant::now() + d;
        let mut guard = self.inner.state.lock().unwrap();
        while !guard.cancelled {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (g, result) = self.inner.condvar.wait_timeout(guard, remaining).unwrap();
            guard = g;
            if result.timed_out() && !guard.cancelled {
                return None;
            }
        }
        guard.cause
    }

    /// Register a callback that fires exactly once, synchronously, the moment this
    /// token is observed cancelled (immediately, inline, if it already is).
    pub fn on_cancel(&self, callback: impl FnOnce(Cause) + Send + 'static) {
        let _ = self.on_cancel_removable(callback);
    }

    /// Like [`Self::on_cancel`], but returns an id that can be used to deregister the
    /// callback before it fires (`None` if it already fired inline). Used by
    /// [`Self::any_of`] so a short-lived combinator doesn't leave a permanent
    /// registration behind on a long-lived token.
    fn on_cancel_removable(&self, callback: impl FnOnce(Cause) + Send + 'static) -> Option<u64> {
        let mut guard = self.inner.state.lock().unwrap();
        if let Some(cause) = guard.cause {
            drop(guard);
            callback(cause);
            return None;
        }
        let id = guard.next_callback_id;
        guard.next_callback_id += 1;
        guard.callbacks.insert(id, Box::new(callback));
        Some(id)
    }

    fn remove_callback(&self, id: u64) {
        self.inner.state.lock().unwrap().callbacks.remove(&id);
    }

    fn fire(inner: &Arc<Inner>, cause: Cause) {
        let callbacks = {
            let mut state: MutexGuard<'_, State> = inner.state.lock().unwrap();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.cause = Some(cause);
            std::mem::take(&mut state.callbacks)
        };
        inner.condvar.notify_all();
        for (_, cb) in callbacks {
            cb(cause);
        }
    }
}

/// Deregisters an [`CancellationToken::any_of`] linkage when dropped.
pub struct AnyOfGuard {
    a: CancellationToken,
    id_a: Option<u64>,
    b: CancellationToken,
    id_b: Option<u64>,
}

impl Drop for AnyOfGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id_a {
            self.a.remove_callback(id);
        }
        if let Some(id) = self.id_b {
            self.b.remove_callback(id);
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
