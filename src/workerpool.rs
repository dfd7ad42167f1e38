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

//! Bounded worker pool of long-lived `std::thread` workers, with graceful drain,
//! forced close, and panic recovery at the worker boundary. See `SPEC_FULL.md` §4.6.

use crate::cancellation::CancellationToken;
use crate::error::{Error, ErrorKind, Result};
use crate::observability::Observability;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The outcome a task reports back to the pool, distinct from a panic (which the
/// pool itself catches).
pub enum TaskOutcome {
    Completed,
    Failed,
}

pub type Task = Box<dyn FnOnce(&CancellationToken) -> TaskOutcome + Send>;
pub type Decorator = Arc<dyn Fn(Task) -> Task + Send + Sync>;
pub type PanicHandler = Arc<dyn Fn(&str) + Send + Sync>;

struct Submission {
    task: Task,
    caller_token: CancellationToken,
}

struct Queue {
    items: VecDeque<Submission>,
    draining: bool,
    closed: bool,
}

/// Snapshot of worker pool activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerPoolMetrics {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
}

/// [`WorkerPool`] configuration.
pub struct WorkerPoolConfig {
    pub name: String,
    pub size: usize,
    pub queue_capacity: usize,
    pub decorator: Option<Decorator>,
    pub panic_handler: Option<PanicHandler>,
    pub observability: Observability,
}

impl WorkerPoolConfig {
    pub fn new(name: impl Into<String>, size: usize, queue_capacity: usize) -> Self {
        assert!(size > 0, "worker pool size must be positive");
        Self { name: name.into(), size, queue_capacity, decorator: None, panic_handler: None, observability: Observability::default() }
    }

    #[must_use]
    pub fn with_decorator(mut self, decorator: impl Fn(Task) -> Task + Send + Sync + 'static) -> Self {
        self.decorator = Some(Arc::new(decorator));
        self
    }

    #[must_use]
    pub fn with_panic_handler(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.panic_handler = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn with_observability(mut self, observability: Observability) -> Self {
        self.observability = observability;
        self
    }
}

struct Shared {
    name: String,
    queue_capacity: usize,
    queue: Mutex<Queue>,
    not_full: Condvar,
    not_empty: Condvar,
    workers_idle: Condvar,
    base_token: CancellationToken,
    closed: AtomicBool,
    running: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    decorator: Option<Decorator>,
    panic_handler: Option<PanicHandler>,
    observability: Observability,
}

/// A bounded pool of long-lived worker threads.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let shared = Arc::new(Shared {
            name: config.name,
            queue_capacity: config.queue_capacity,
            queue: Mutex::new(Queue { items: VecDeque::new(), draining: false, closed: false }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            workers_idle: Condvar::new(),
            base_token: CancellationToken::new(),
            closed: AtomicBool::new(false),
            running: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            decorator: config.decorator,
            panic_handler: config.panic_handler,
            observability: config.observability,
        });

        let mut workers = Vec::with_capacity(config.size);
        for _ in 0..config.size {
            let shared = shared.clone();
            workers.push(std::thread::spawn(move || worker_loop(shared)));
        }

        Self { shared, workers: Mutex::new(workers) }
    }

    /// Enqueue `task`, blocking until there is room or `token` cancels. Fails with
    /// `PoolClosed` if closed or draining.
    ///
    /// A pool configured with `queue_capacity == 0` never buffers: this call blocks
    /// until a worker has actually picked up `task`, i.e. synchronous handoff, rather
    /// than returning as soon as one item has been parked in an intake buffer.
    pub fn submit(&self, token: &CancellationToken, task: Task) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if queue.closed || queue.draining {
            return Err(self.err(ErrorKind::PoolClosed, "submit"));
        }
        let capacity = self.shared.queue_capacity;
        while queue.items.len() >= capacity.max(1) && !queue.closed && !queue.draining {
            if token.is_cancelled() {
                let kind = match token.cause() {
                    Some(crate::cancellation::Cause::DeadlineExceeded) => ErrorKind::AcquireTimeout,
                    _ => ErrorKind::Cancelled,
                };
                return Err(self.err(kind, "submit"));
            }
            self.shared.not_full.wait_for(&mut queue, Duration::from_millis(20));
        }
        if queue.closed || queue.draining {
            return Err(self.err(ErrorKind::PoolClosed, "submit"));
        }
        self.enqueue(&mut queue, task, token.clone());

        if capacity == 0 {
            // The blocking-push condition above admits at most one resident item at
            // a time, so the only item that can be in the queue here is the one we
            // just pushed: waiting for the queue to empty again is waiting for a
            // worker to take exactly this submission.
            loop {
                if queue.items.is_empty() {
                    break;
                }
                if token.is_cancelled() {
                    if !queue.items.is_empty() {
                        // Not yet taken by a worker: withdraw it so a cancelled
                        // caller never observes its task silently running anyway.
                        queue.items.clear();
                        let kind = match token.cause() {
                            Some(crate::cancellation::Cause::DeadlineExceeded) => ErrorKind::AcquireTimeout,
                            _ => ErrorKind::Cancelled,
                        };
                        return Err(self.err(kind, "submit"));
                    }
                    break;
                }
                self.shared.not_full.wait_for(&mut queue, Duration::from_millis(20));
            }
        }
        Ok(())
    }

    /// Non-blocking: fails `QueueFull` if the intake is at capacity, `PoolClosed` if
    /// closed or draining. Against a `queue_capacity == 0` pool this can only ever
    /// admit a task no worker has taken yet (there is no buffer to hand off through
    /// without blocking); it never waits for a worker to actually pick it up the way
    /// [`Self::submit`] does.
    pub fn try_submit(&self, token: &CancellationToken, task: Task) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if queue.closed || queue.draining {
            return Err(self.err(ErrorKind::PoolClosed, "try_submit"));
        }
        if queue.items.len() >= self.shared.queue_capacity.max(1) {
            return Err(self.err(ErrorKind::QueueFull, "try_submit"));
        }
        self.enqueue(&mut queue, task, token.clone());
        Ok(())
    }

    fn enqueue(&self, queue: &mut Queue, task: Task, caller_token: CancellationToken) {
        let task = match &self.shared.decorator {
            Some(decorator) => decorator(task),
            None => task,
        };
        queue.items.push_back(Submission { task, caller_token });
        self.shared
            .observability
            .metrics
            .gauge("workerpool_queue_depth", queue.items.len() as f64, &[("instance", &self.shared.name)]);
        self.shared
            .observability
            .metrics
            .inc("workerpool_submitted_total", &[("instance", &self.shared.name), ("result", "accepted")]);
        self.shared.not_empty.notify_one();
    }

    /// Stop accepting new work and wait until the intake is empty and every worker
    /// is idle, or `token` cancels. Already-queued tasks continue to run.
    pub fn drain(&self, token: &CancellationToken) -> Result<()> {
        {
            let mut queue = self.shared.queue.lock();
            queue.draining = true;
        }
        self.shared.not_full.notify_all();
        loop {
            let queue = self.shared.queue.lock();
            let idle = queue.items.is_empty() && self.shared.running.load(Ordering::SeqCst) == 0;
            drop(queue);
            if idle {
                return Ok(());
            }
            if token.is_cancelled() {
                let kind = match token.cause() {
                    Some(crate::cancellation::Cause::DeadlineExceeded) => ErrorKind::AcquireTimeout,
                    _ => ErrorKind::Cancelled,
                };
                return Err(self.err(kind, "drain"));
            }
            let mut queue = self.shared.queue.lock();
            self.shared.workers_idle.wait_for(&mut queue, Duration::from_millis(20));
        }
    }

    /// Stop accepting new work, cancel the pool's base token (inviting in-flight
    /// tasks to abort cooperatively), and wait for every worker thread to exit or
    /// `token` to cancel. Idempotent: a second call returns immediately.
    pub fn close(&self, token: &CancellationToken) -> Result<()> {
        let already_closed = self.shared.closed.swap(true, Ordering::SeqCst);
        if already_closed {
            return Ok(());
        }
        {
            let mut queue = self.shared.queue.lock();
            queue.closed = true;
            queue.draining = true;
        }
        self.shared.base_token.cancel();
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();

        let mut workers = self.workers.lock();
        let handles = std::mem::take(&mut *workers);
        drop(workers);
        for handle in handles {
            if token.is_cancelled() {
                let kind = match token.cause() {
                    Some(crate::cancellation::Cause::DeadlineExceeded) => ErrorKind::AcquireTimeout,
                    _ => ErrorKind::Cancelled,
                };
                return Err(self.err(kind, "close"));
            }
            let _ = handle.join();
        }
        Ok(())
    }

    pub fn metrics(&self) -> WorkerPoolMetrics {
        WorkerPoolMetrics {
            queued: self.shared.queue.lock().items.len() as u64,
            running: self.shared.running.load(Ordering::SeqCst),
            completed: self.shared.completed.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
            panicked: self.shared.panicked.load(Ordering::SeqCst),
        }
    }

    fn err(&self, kind: ErrorKind, operation: &'static str) -> Error {
        Error::new(kind, self.shared.name.clone(), operation)
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.base_token.is_cancelled() {
            return;
        }
        let (submission, depth) = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(submission) = queue.items.pop_front() {
                    break (Some(submission), queue.items.len());
                }
                if queue.draining || shared.base_token.is_cancelled() {
                    break (None, queue.items.len());
                }
                shared.not_empty.wait_for(&mut queue, Duration::from_millis(20));
            }
        };
        shared.observability.metrics.gauge("workerpool_queue_depth", depth as f64, &[("instance", &shared.name)]);
        shared.not_full.notify_one();

        let Some(submission) = submission else {
            // Draining (or the pool closed) with nothing left in the intake: this
            // worker has no more work, ever — draining is one-way.
            shared.workers_idle.notify_all();
            return;
        };

        let (effective_token, any_of_guard) = CancellationToken::any_of(&submission.caller_token, &shared.base_token);
        shared.running.fetch_add(1, Ordering::SeqCst);
        shared.observability.metrics.gauge("workerpool_running", shared.running.load(Ordering::SeqCst) as f64, &[("instance", &shared.name)]);

        let task = submission.task;
        let result = catch_unwind(AssertUnwindSafe(|| task(&effective_token)));
        // Deregister the linkage against `base_token` now, rather than leaving it to
        // fire (or never fire) later — otherwise every submission would leave a
        // permanent callback behind on the pool's long-lived base token.
        drop(any_of_guard);

        shared.running.fetch_sub(1, Ordering::SeqCst);
        match result {
            Ok(TaskOutcome::Completed) => {
                shared.completed.fetch_add(1, Ordering::SeqCst);
                shared.observability.metrics.inc("workerpool_completed_total", &[("instance", &shared.name)]);
            }
            Ok(TaskOutcome::Failed) => {
                shared.failed.fetch_add(1, Ordering::SeqCst);
                shared.observability.metrics.inc("workerpool_failed_total", &[("instance", &shared.name)]);
            }
            Err(payload) => {
                shared.panicked.fetch_add(1, Ordering::SeqCst);
                shared.observability.metrics.inc("workerpool_panicked_total", &[("instance", &shared.name)]);
                let message = panic_message(&payload);
                if let Some(handler) = &shared.panic_handler {
                    handler(&message);
                } else {
                    shared.observability.logger.warn(&format!("worker task panicked: {message}"), &[("instance", &shared.name)]);
                }
            }
        }
        shared.workers_idle.notify_all();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    #[test]
    fn drain_waits_for_all_queued_tasks_to_complete() {
        let pool = WorkerPool::new(WorkerPoolConfig::new("t", 2, 5));
        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..7 {
            let completed = completed.clone();
            let token = CancellationToken::new();
            pool.submit(
                &token,
                Box::new(move |_| {
                    std::thread::sleep(StdDuration::from_millis(10));
                    completed.fetch_add(1, Ordering::SeqCst);
                    TaskOutcome::Completed
                }),
            )
            .unwrap();
        }
        let drain_token = CancellationToken::new();
        pool.drain(&drain_token).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 7);
        assert_eq!(pool.metrics().completed, 7);
    }

    #[test]
    fn submit_after_close_fails_pool_closed() {
        let pool = WorkerPool::new(WorkerPoolConfig::new("t", 1, 1));
        let token = CancellationToken::new();
        pool.close(&token).unwrap();
        let err = pool.try_submit(&token, Box::new(|_| TaskOutcome::Completed)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolClosed);
    }

    #[test]
    fn close_is_idempotent() {
        let pool = WorkerPool::new(WorkerPoolConfig::new("t", 1, 1));
        let token = CancellationToken::new();
        pool.close(&token).unwrap();
        pool.close(&token).unwrap();
    }

    #[test]
    fn try_submit_fails_queue_full_when_bounded_intake_saturated() {
        let pool = WorkerPool::new(WorkerPoolConfig::new("t", 1, 1));
        let token = CancellationToken::new();
        let blocker = Arc::new(std::sync::Barrier::new(2));
        let b = blocker.clone();
        pool.submit(
            &token,
            Box::new(move |_| {
                b.wait();
                TaskOutcome::Completed
            }),
        )
        .unwrap();
        // Fill the queue behind the task currently running.
        pool.try_submit(&token, Box::new(|_| TaskOutcome::Completed)).unwrap();
        let err = pool.try_submit(&token, Box::new(|_| TaskOutcome::Completed));
        blocker.wait();
        assert_eq!(err.unwrap_err().kind(), ErrorKind::QueueFull);
    }

    #[test]
    fn panicking_task_is_recovered_and_counted_without_killing_worker() {
        let pool = WorkerPool::new(WorkerPoolConfig::new("t", 1, 2));
        let token = CancellationToken::new();
        pool.submit(&token, Box::new(|_| panic!("boom"))).unwrap();
        let completed = Arc::new(AtomicUsize::new(0));
        let c = completed.clone();
        pool.submit(
            &token,
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                TaskOutcome::Completed
            }),
        )
        .unwrap();
        let drain_token = CancellationToken::new();
        pool.drain(&drain_token).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().panicked, 1);
    }

    #[test]
    fn zero_capacity_pool_hands_off_synchronously() {
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::new("t", 1, 0)));
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let token = CancellationToken::new();
        pool.submit(
            &token,
            Box::new(move |_| {
                std::thread::sleep(StdDuration::from_millis(5));
                r.store(true, Ordering::SeqCst);
                TaskOutcome::Completed
            }),
        )
        .unwrap();
        // submit() only returned once the worker had already taken the task, so it
        // must be running (or already finished) rather than sitting in a buffer.
        std::thread::sleep(StdDuration::from_millis(20));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(pool.metrics().queued, 0);
    }

    #[test]
    fn close_cancels_effective_token_for_in_flight_tasks() {
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::new("t", 1, 1)));
        let observed_cancel = Arc::new(AtomicBool::new(false));
        let started = Arc::new(std::sync::Barrier::new(2));
        let oc = observed_cancel.clone();
        let s = started.clone();
        let token = CancellationToken::new();
        pool.submit(
            &token,
            Box::new(move |effective| {
                s.wait();
                let cause = effective.wait_cancelled();
                oc.store(true, Ordering::SeqCst);
                let _ = cause;
                TaskOutcome::Completed
            }),
        )
        .unwrap();
        started.wait();
        let close_token = CancellationToken::new();
        pool.close(&close_token).unwrap();
        assert!(observed_cancel.load(Ordering::SeqCst));
    }
}
