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

//! Rate limiting: a burst-tolerant [`TokenBucket`], a burst-smoothing [`LeakyBucket`],
//! and a [`MultiTierLimiter`] composite that routes requests through global, route,
//! and resource sub-limiters. See `SPEC_FULL.md` §4.3-§4.4, §4.7.

mod leaky_bucket;
mod multi_tier;
mod token_bucket;

pub use leaky_bucket::LeakyBucket;
pub use multi_tier::{MultiTierConfig, MultiTierLimiter, Request, RouteConfig};
pub use token_bucket::TokenBucket;

use crate::observability::Observability;
use std::time::Duration;

/// Shared configuration for [`TokenBucket`] and [`LeakyBucket`].
#[derive(Clone)]
pub struct RateLimiterConfig {
    pub name: String,
    /// Refill (token bucket) or leak (leaky bucket) rate, in units per second.
    pub rate: f64,
    /// Maximum bucket contents (token bucket) or queue depth (leaky bucket).
    pub burst: u64,
    /// Jitter applied to a computed wait: the actual wait is sampled uniformly from
    /// `[d, d * (1 + jitter_factor)]`, so jitter only ever extends a wait. `0.0`
    /// disables jitter.
    pub jitter_factor: f64,
    pub observability: Observability,
}

impl RateLimiterConfig {
    pub fn new(name: impl Into<String>, rate: f64, burst: u64) -> Self {
        Self {
            name: name.into(),
            rate,
            burst,
            jitter_factor: 0.1,
            observability: Observability::default(),
        }
    }

    #[must_use]
    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    #[must_use]
    pub fn with_observability(mut self, observability: Observability) -> Self {
        self.observability = observability;
        self
    }
}

/// Sample a jittered wait duration uniformly from `[d, d * (1 + jitter_factor)]`.
/// Jitter only ever extends a wait; a waiter is never woken before `d` has elapsed.
pub(crate) fn jittered(d: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return d;
    }
    let extra_fraction = rand::random::<f64>() * jitter_factor;
    d + d.mul_f64(extra_fraction)
}
