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

//! Error taxonomy shared by every primitive in this crate.
//!
//! Operational conditions (cancellation, capacity exhaustion, timeouts, a tripped
//! circuit) are values of [`Error`]. Misuse of a primitive's contract (releasing more
//! permits than were acquired, configuring a zero capacity) is a programmer error and
//! panics instead, per the crate-wide philosophy in `SPEC_FULL.md` §7.

use std::time::Duration;

/// The kind of condition a primitive reports as a recoverable [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A requested semaphore weight was zero or negative.
    InvalidWeight,
    /// A requested weight exceeds the primitive's total capacity.
    WeightExceedsCapacity,
    /// A blocking call's token reached its deadline before being satisfied.
    AcquireTimeout,
    /// A blocking call's token was explicitly cancelled.
    Cancelled,
    /// The worker pool is closed or draining and refuses new work.
    PoolClosed,
    /// The worker pool's bounded intake was full for a non-blocking submission.
    QueueFull,
    /// The circuit breaker is Open (or Half-Open and at its in-flight cap).
    CircuitOpen,
    /// A multi-tier limiter tier denied the request.
    RateLimitExceeded,
    /// A named bucket (from header-derived rate limit state) is exhausted.
    BucketLimit,
    /// The multi-tier limiter's global tier denied the request.
    GlobalLimit,
}

impl ErrorKind {
    fn message(self) -> &'static str {
        match self {
            ErrorKind::InvalidWeight => "invalid weight",
            ErrorKind::WeightExceedsCapacity => "weight exceeds capacity",
            ErrorKind::AcquireTimeout => "acquire timed out",
            ErrorKind::Cancelled => "operation cancelled",
            ErrorKind::PoolClosed => "pool closed",
            ErrorKind::QueueFull => "queue full",
            ErrorKind::CircuitOpen => "circuit open",
            ErrorKind::RateLimitExceeded => "rate limit exceeded",
            ErrorKind::BucketLimit => "bucket limit exceeded",
            ErrorKind::GlobalLimit => "global limit exceeded",
        }
    }
}

/// Structured error returned by every fallible operation in this crate.
///
/// Carries the error [`kind`](Error::kind), the owning instance's `name`, the
/// operation that failed, an optional `retry_after` hint, and an optional underlying
/// cause reachable through [`std::error::Error::source`].
#[derive(Debug, thiserror::Error)]
#[error("{instance}.{operation}: {kind}", kind = self.kind.message())]
pub struct Error {
    kind: ErrorKind,
    instance: String,
    operation: &'static str,
    retry_after: Option<Duration>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a new error for `instance` (the owning primitive's configured name)
    /// failing `operation`.
    pub fn new(kind: ErrorKind, instance: impl Into<String>, operation: &'static str) -> Self {
        Self {
            kind,
            instance: instance.into(),
            operation,
            retry_after: None,
            source: None,
        }
    }

    /// Attach a `retry_after` hint (used by rate-limit and circuit-breaker errors).
    #[must_use]
    pub fn with_retry_after(mut self, d: Duration) -> Self {
        self.retry_after = Some(d);
        self
    }

    /// Attach an underlying cause, preserved through [`std::error::Error::source`].
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

pub type Result<T> = std::result::Result<T, Error>;
