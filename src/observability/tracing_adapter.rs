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

//! Real-deployment implementations of the observability trio, bridging onto
//! `tracing` (logger, tracer) and the `metrics` facade crate (counters/gauges/
//! histograms). Opt-in: a caller wires these into a primitive's config explicitly,
//! they are never reached through the [`super::NoOpObservability`] default path.

use super::{Kv, Logger, MetricsRecorder, Span, Tracer};
use tracing::field::display;

fn record_kv(span: &tracing::Span, kv: &[Kv<'_>]) {
    for (k, v) in kv {
        span.record(*k, display(v));
    }
}

/// [`Logger`] backed by the `tracing` crate's levelled events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, msg: &str, kv: &[Kv<'_>]) {
        tracing::debug!(kv = ?kv, "{msg}");
    }

    fn info(&self, msg: &str, kv: &[Kv<'_>]) {
        tracing::info!(kv = ?kv, "{msg}");
    }

    fn warn(&self, msg: &str, kv: &[Kv<'_>]) {
        tracing::warn!(kv = ?kv, "{msg}");
    }

    fn error(&self, msg: &str, err: &dyn std::error::Error, kv: &[Kv<'_>]) {
        tracing::error!(kv = ?kv, error = %err, "{msg}");
    }
}

/// [`MetricsRecorder`] backed by the `metrics` facade crate's global recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCrateRecorder;

fn owned_labels(kv: &[Kv<'_>]) -> Vec<(String, String)> {
    kv.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

impl MetricsRecorder for MetricsCrateRecorder {
    fn inc(&self, name: &str, kv: &[Kv<'_>]) {
        metrics::counter!(name.to_string(), owned_labels(kv)).increment(1);
    }

    fn add(&self, name: &str, v: f64, kv: &[Kv<'_>]) {
        metrics::counter!(name.to_string(), owned_labels(kv)).increment(v as u64);
    }

    fn gauge(&self, name: &str, v: f64, kv: &[Kv<'_>]) {
        metrics::gauge!(name.to_string(), owned_labels(kv)).set(v);
    }

    fn histogram(&self, name: &str, v: f64, kv: &[Kv<'_>]) {
        metrics::histogram!(name.to_string(), owned_labels(kv)).record(v);
    }
}

struct TracingSpan {
    span: tracing::Span,
    entered: Option<tracing::span::EnteredSpan>,
}

impl Span for TracingSpan {
    fn finish(mut self: Box<Self>, err: Option<&dyn std::error::Error>) {
        if let Some(err) = err {
            tracing::error!(parent: &self.span, error = %err, "span finished with error");
        }
        self.entered.take();
    }
}

/// [`Tracer`] backed by `tracing` spans.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start(&self, name: &str, kv: &[Kv<'_>]) -> Box<dyn Span> {
        let span = tracing::info_span!("op", name = %name);
        record_kv(&span, kv);
        let entered = span.clone().entered();
        Box::new(TracingSpan { span, entered: Some(entered) })
    }
}
