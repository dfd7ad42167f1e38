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

//! Concurrency primitives for bounding and shaping work across threads: a weighted
//! semaphore, token and leaky bucket rate limiters (plus a multi-tier composite), a
//! circuit breaker, and a bounded worker pool.
//!
//! Every blocking operation takes a [`cancellation::CancellationToken`] rather than
//! baking in a single timeout parameter; a deadline is expressed as a token that
//! cancels itself when a [`clock::Clock`] reaches it. No primitive reads global or
//! wall-clock state directly — time, cancellation, and observability are all passed
//! in, so every primitive in this crate is independently testable against a
//! deterministic [`clock::TestClock`].

pub mod cancellation;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod observability;
pub mod ratelimit;
pub mod semaphore;
pub mod workerpool;

pub use cancellation::{CancellationToken, Cause};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState};
pub use clock::{Clock, SystemClock, TestClock};
pub use error::{Error, ErrorKind, Result};
pub use observability::Observability;
pub use ratelimit::{LeakyBucket, MultiTierConfig, MultiTierLimiter, RateLimiterConfig, Request, RouteConfig, TokenBucket};
pub use semaphore::{Fairness, SemaphoreConfig, WeightedSemaphore};
pub use workerpool::{TaskOutcome, WorkerPool, WorkerPoolConfig};
