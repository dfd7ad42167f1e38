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

use super::{Kv, Logger, MetricsRecorder, Span, Tracer};

/// Implements all three observability traits as zero-allocation no-ops. Used as the
/// default so a primitive constructed without an explicit `Observability` pays
/// nothing for telemetry it doesn't want.
pub struct NoOpObservability;

impl Logger for NoOpObservability {
    fn debug(&self, _msg: &str, _kv: &[Kv<'_>]) {}
    fn info(&self, _msg: &str, _kv: &[Kv<'_>]) {}
    fn warn(&self, _msg: &str, _kv: &[Kv<'_>]) {}
    fn error(&self, _msg: &str, _err: &dyn std::error::Error, _kv: &[Kv<'_>]) {}
}

impl MetricsRecorder for NoOpObservability {
    fn inc(&self, _name: &str, _kv: &[Kv<'_>]) {}
    fn add(&self, _name: &str, _v: f64, _kv: &[Kv<'_>]) {}
    fn gauge(&self, _name: &str, _v: f64, _kv: &[Kv<'_>]) {}
    fn histogram(&self, _name: &str, _v: f64, _kv: &[Kv<'_>]) {}
}

struct NoOpSpan;
impl Span for NoOpSpan {
    fn finish(self: Box<Self>, _err: Option<&dyn std::error::Error>) {}
}

impl Tracer for NoOpObservability {
    fn start(&self, _name: &str, _kv: &[Kv<'_>]) -> Box<dyn Span> {
        Box::new(NoOpSpan)
    }
}
