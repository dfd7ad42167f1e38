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

//! The observability trio every primitive's config carries: a structured logger, a
//! metrics recorder, and a tracer. Each has a zero-cost [`NoOp`] default and a
//! `tracing`/`metrics`-crate-backed implementation for real deployments. See
//! `SPEC_FULL.md` §4.0.

mod noop;
mod tracing_adapter;

pub use noop::NoOpObservability;
pub use tracing_adapter::{TracingLogger, TracingTracer, MetricsCrateRecorder};

/// A single structured key-value attribute attached to a log line, metric, or span.
pub type Kv<'a> = (&'a str, &'a str);

/// Levelled, structured logger.
pub trait Logger: Send + Sync {
    fn debug(&self, msg: &str, kv: &[Kv<'_>]);
    fn info(&self, msg: &str, kv: &[Kv<'_>]);
    fn warn(&self, msg: &str, kv: &[Kv<'_>]);
    fn error(&self, msg: &str, err: &dyn std::error::Error, kv: &[Kv<'_>]);
}

/// Counter / gauge / histogram recorder.
pub trait MetricsRecorder: Send + Sync {
    /// Increment a counter by one.
    fn inc(&self, name: &str, kv: &[Kv<'_>]);
    /// Add `v` to a counter.
    fn add(&self, name: &str, v: f64, kv: &[Kv<'_>]);
    /// Set a gauge to `v`.
    fn gauge(&self, name: &str, v: f64, kv: &[Kv<'_>]);
    /// Record an observation into a histogram.
    fn histogram(&self, name: &str, v: f64, kv: &[Kv<'_>]);
}

/// An in-flight span started by [`Tracer::start`]. Must be finished exactly once.
pub trait Span {
    fn finish(self: Box<Self>, err: Option<&dyn std::error::Error>);
}

/// Span-based tracer.
pub trait Tracer: Send + Sync {
    fn start(&self, name: &str, kv: &[Kv<'_>]) -> Box<dyn Span>;
}

/// The three observability capabilities bundled together, as every primitive's
/// config carries them. Defaults to [`NoOpObservability`].
#[derive(Clone)]
pub struct Observability {
    pub logger: std::sync::Arc<dyn Logger>,
    pub metrics: std::sync::Arc<dyn MetricsRecorder>,
    pub tracer: std::sync::Arc<dyn Tracer>,
}

impl Default for Observability {
    fn default() -> Self {
        Self {
            logger: std::sync::Arc::new(NoOpObservability),
            metrics: std::sync::Arc::new(NoOpObservability),
            tracer: std::sync::Arc::new(NoOpObservability),
        }
    }
}

impl std::fmt::Debug for Observability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observability").finish_non_exhaustive()
    }
}
