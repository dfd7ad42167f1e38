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

//! Burst-tolerant rate limiter: a bucket refills continuously up to `burst` and
//! admits a request as long as enough tokens have accumulated. See `SPEC_FULL.md` §4.3.

use super::RateLimiterConfig;
use crate::cancellation::{CancellationToken, Cause};
use crate::clock::Clock;
use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct State {
    tokens: f64,
    last_refill: Option<Instant>,
}

enum WaitFor {
    Ready,
    Indefinite,
    For(Duration),
}

/// Token bucket rate limiter: `allow` never blocks, `wait` blocks (with cancellation)
/// until enough tokens have accumulated.
pub struct TokenBucket {
    name: String,
    rate: f64,
    burst: f64,
    jitter_factor: f64,
    clock: Arc<dyn Clock>,
    observability: crate::observability::Observability,
    state: Mutex<State>,
}

impl TokenBucket {
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: config.name,
            rate: config.rate,
            burst: config.burst as f64,
            jitter_factor: config.jitter_factor,
            clock,
            observability: config.observability,
            state: Mutex::new(State { tokens: 0.0, last_refill: None }),
        }
    }

    /// Non-blocking: refill, then admit `n` if enough tokens are available.
    pub fn allow(&self, n: u64) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        let n = n as f64;
        if state.tokens >= n {
            state.tokens -= n;
            self.observability.metrics.inc("ratelimit_allow_total", &[("instance", &self.name), ("result", "success")]);
            true
        } else {
            self.observability.metrics.inc("ratelimit_allow_total", &[("instance", &self.name), ("result", "denied")]);
            false
        }
    }

    /// Snapshot of current tokens.
    pub fn tokens(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// Block (with jittered backoff, respecting cancellation) until `n` tokens can be
    /// consumed, or the token cancels.
    pub fn wait(&self, token: &CancellationToken, n: u64) -> Result<()> {
        if n as f64 > self.burst {
            return Err(Error::new(ErrorKind::WeightExceedsCapacity, self.name.clone(), "wait"));
        }
        loop {
            let now = self.clock.now();
            let wait_for = {
                let mut state = self.state.lock();
                self.refill(&mut state, now);
                let nf = n as f64;
                if state.tokens >= nf {
                    state.tokens -= nf;
                    WaitFor::Ready
                } else if self.rate <= 0.0 {
                    // A zero (or otherwise non-refilling) rate never accumulates enough
                    // tokens on its own; there is no finite duration to sleep for, so
                    // wait on the token with no timeout instead of computing one.
                    WaitFor::Indefinite
                } else {
                    let deficit = nf - state.tokens;
                    WaitFor::For(Duration::from_secs_f64(deficit / self.rate))
                }
            };
            match wait_for {
                WaitFor::Ready => {
                    self.observability.metrics.inc("ratelimit_allow_total", &[("instance", &self.name), ("result", "success")]);
                    return Ok(());
                }
                WaitFor::Indefinite => {
                    let cause = token.wait_cancelled();
                    let kind = match cause {
                        Cause::DeadlineExceeded => ErrorKind::AcquireTimeout,
                        Cause::UserCancelled => ErrorKind::Cancelled,
                    };
                    return Err(Error::new(kind, self.name.clone(), "wait"));
                }
                WaitFor::For(base_wait) => {
                    let jittered = super::jittered(base_wait, self.jitter_factor);
                    self.observability.metrics.histogram("ratelimit_wait_duration_seconds", jittered.as_secs_f64(), &[("instance", &self.name)]);
                    match token.wait_cancelled_for(jittered) {
                        None => continue,
                        Some(cause) => {
                            let kind = match cause {
                                Cause::DeadlineExceeded => ErrorKind::AcquireTimeout,
                                Cause::UserCancelled => ErrorKind::Cancelled,
                            };
                            return Err(Error::new(kind, self.name.clone(), "wait"));
                        }
                    }
                }
            }
        }
    }

    fn refill(&self, state: &mut State, now: Instant) {
        match state.last_refill {
            None => {
                state.tokens = self.burst;
                state.last_refill = Some(now);
            }
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = Some(now);
            }
        }
    }
}
