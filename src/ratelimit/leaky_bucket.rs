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

//! Burst-smoothing rate limiter: tracks outstanding "level" which leaks away over
//! time, admitting a request only if it fits under `capacity`. See `SPEC_FULL.md` §4.4.

use super::RateLimiterConfig;
use crate::cancellation::{CancellationToken, Cause};
use crate::clock::Clock;
use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct State {
    level: f64,
    last_leak: Option<Instant>,
}

enum WaitFor {
    Ready,
    Indefinite,
    For(Duration),
}

/// Leaky bucket rate limiter. `rate` is the leak rate (work units drained per
/// second); `capacity` bounds outstanding level, i.e. queue depth.
pub struct LeakyBucket {
    name: String,
    rate: f64,
    capacity: f64,
    jitter_factor: f64,
    clock: Arc<dyn Clock>,
    observability: crate::observability::Observability,
    state: Mutex<State>,
}

impl LeakyBucket {
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: config.name,
            rate: config.rate,
            capacity: config.burst as f64,
            jitter_factor: config.jitter_factor,
            clock,
            observability: config.observability,
            state: Mutex::new(State { level: 0.0, last_leak: None }),
        }
    }

    pub fn allow(&self, n: u64) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.leak(&mut state, now);
        let n = n as f64;
        if state.level + n <= self.capacity {
            state.level += n;
            self.observability.metrics.inc("ratelimit_allow_total", &[("instance", &self.name), ("result", "success")]);
            true
        } else {
            self.observability.metrics.inc("ratelimit_allow_total", &[("instance", &self.name), ("result", "denied")]);
            false
        }
    }

    /// Snapshot of current outstanding level.
    pub fn level(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.leak(&mut state, now);
        state.level
    }

    pub fn wait(&self, token: &CancellationToken, n: u64) -> Result<()> {
        if n as f64 > self.capacity {
            return Err(Error::new(ErrorKind::WeightExceedsCapacity, self.name.clone(), "wait"));
        }
        loop {
            let now = self.clock.now();
            let wait_for = {
                let mut state = self.state.lock();
                self.leak(&mut state, now);
                let nf = n as f64;
                if state.level + nf <= self.capacity {
                    state.level += nf;
                    WaitFor::Ready
                } else if self.rate <= 0.0 {
                    // A zero (or otherwise non-draining) rate never leaks the level
                    // down; there is no finite duration to sleep for, so wait on the
                    // token with no timeout instead of computing one.
                    WaitFor::Indefinite
                } else {
                    let overflow = state.level + nf - self.capacity;
                    WaitFor::For(Duration::from_secs_f64(overflow / self.rate))
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

    fn leak(&self, state: &mut State, now: Instant) {
        match state.last_leak {
            None => {
                state.level = 0.0;
                state.last_leak = Some(now);
            }
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                state.level = (state.level - elapsed * self.rate).max(0.0);
                state.last_leak = Some(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn bucket(rate: f64, capacity: u64, clock: Arc<TestClock>) -> LeakyBucket {
        LeakyBucket::new(RateLimiterConfig::new("t", rate, capacity), clock)
    }

    #[test]
    fn smooths_bursts_under_capacity() {
        let clock = Arc::new(TestClock::new());
        let b = bucket(3.0, 6, clock.clone());
        for _ in 0..6 {
            assert!(b.allow(1));
        }
        assert!(!b.allow(1));
        clock.advance(Duration::from_secs(1));
        // 3 units/sec leaked away.
        assert!((b.level() - 3.0).abs() < 1e-9);
        assert!(b.allow(1));
        assert!(b.allow(1));
        assert!(b.allow(1));
        assert!(!b.allow(1));
    }

    #[test]
    fn level_never_negative() {
        let clock = Arc::new(TestClock::new());
        let b = bucket(10.0, 5, clock.clone());
        b.allow(2);
        clock.advance(Duration::from_secs(10));
        assert_eq!(b.level(), 0.0);
    }

    #[test]
    fn unsatisfiable_request_fails_fast() {
        let clock = Arc::new(TestClock::new());
        let b = bucket(1.0, 5, clock);
        let token = CancellationToken::new();
        let err = b.wait(&token, 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WeightExceedsCapacity);
    }

    #[test]
    fn zero_rate_waits_indefinitely_instead_of_panicking() {
        let clock = Arc::new(TestClock::new());
        let b = bucket(0.0, 1, clock);
        b.allow(1);
        let token = CancellationToken::new();
        let t = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            t.cancel();
        });
        let err = b.wait(&token, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        handle.join().unwrap();
    }
}
