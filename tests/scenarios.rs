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

//! End-to-end scenarios exercising public API surfaces together, as opposed to the
//! per-module unit tests that reach into crate-private state.

use concurry::ratelimit::{MultiTierConfig, MultiTierLimiter, Request, RouteConfig};
use concurry::workerpool::{TaskOutcome, WorkerPool, WorkerPoolConfig};
use concurry::{CancellationToken, CircuitBreaker, CircuitBreakerConfig, CircuitState, Clock, TestClock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn circuit_breaker_guards_a_worker_pool_backed_dependency() {
    let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
    let pool = WorkerPool::new(WorkerPoolConfig::new("downstream", 2, 4));
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::new("downstream", 2, Duration::from_millis(50)), clock);

    let failures = Arc::new(AtomicUsize::new(0));
    let token = CancellationToken::new();

    for _ in 0..2 {
        let failures = failures.clone();
        let result = breaker.execute(
            &token,
            |_| {
                failures.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("downstream unavailable")
            },
            concurry::circuit_breaker::any_err_is_failure,
        );
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // While open, the pool itself is untouched — calls fail fast without
    // submitting work.
    let rejected = breaker.execute(&token, |_| Ok::<_, &str>(()), concurry::circuit_breaker::any_err_is_failure);
    assert!(rejected.is_err());

    let drain_token = CancellationToken::new();
    pool.drain(&drain_token).unwrap();
    assert_eq!(pool.metrics().completed, 0);
}

#[test]
fn multi_tier_limiter_cascades_global_route_and_resource() {
    let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
    let config = MultiTierConfig::new("api", 100.0, 100)
        .with_route("GET:/orders/{id}", RouteConfig::new(2.0, 2))
        .with_default_resource_limit(1.0, 1);
    let limiter = MultiTierLimiter::new(config, clock);

    let order_a = Request::new("GET", "/orders/{id}").with_resource_id("order-a");
    let order_b = Request::new("GET", "/orders/{id}").with_resource_id("order-b");

    assert!(limiter.allow(&order_a));
    // order-a's own resource bucket (burst 1) is now exhausted...
    assert!(!limiter.allow(&order_a));
    // ...but order-b has an independent resource bucket.
    assert!(limiter.allow(&order_b));

    let metrics = limiter.metrics();
    assert_eq!(metrics.resource_denied_total, 1);
}

#[test]
fn worker_pool_drains_while_a_task_blocks_on_cancellation() {
    let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::new("workers", 2, 4)));
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let completed = completed.clone();
        let token = CancellationToken::new();
        pool.submit(
            &token,
            Box::new(move |effective| {
                // Cooperative: exit promptly once asked to, rather than running
                // forever.
                let _ = effective.wait_cancelled_for(Duration::from_millis(5));
                completed.fetch_add(1, Ordering::SeqCst);
                TaskOutcome::Completed
            }),
        )
        .unwrap();
    }

    let drain_token = CancellationToken::new();
    pool.drain(&drain_token).unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 3);
    assert_eq!(pool.metrics().queued, 0);
    assert_eq!(pool.metrics().running, 0);
}
