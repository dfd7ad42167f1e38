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

//! Composite limiter that cascades a request through global, route, and resource
//! sub-limiters. See `SPEC_FULL.md` §4.7.

use super::{RateLimiterConfig, TokenBucket};
use crate::cancellation::CancellationToken;
use crate::clock::Clock;
use crate::error::{Error, ErrorKind, Result};
use crate::observability::Observability;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-route rate, burst, and the request attributes that partition the route into
/// independent sub-buckets (e.g. `user_id` so each user gets their own allowance).
#[derive(Clone)]
pub struct RouteConfig {
    pub rate: f64,
    pub burst: u64,
    pub major_parameter_keys: Vec<String>,
}

impl RouteConfig {
    pub fn new(rate: f64, burst: u64) -> Self {
        Self { rate, burst, major_parameter_keys: Vec::new() }
    }

    #[must_use]
    pub fn partitioned_by(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.major_parameter_keys = keys.into_iter().collect();
        self
    }
}

/// The bag of attributes used to key sub-limiters for one inbound call.
#[derive(Clone, Default)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub resource_id: Option<String>,
    pub sub_resource_id: Option<String>,
    pub user_id: Option<String>,
    pub major_parameters: HashMap<String, String>,
    pub priority: u8,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self { method: method.into(), path: path.into(), ..Default::default() }
    }

    #[must_use]
    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_major_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.major_parameters.insert(key.into(), value.into());
        self
    }

    /// `"METHOD:path"`, with recognised path parameters unused here — callers name
    /// routes with an already-normalised pattern in [`MultiTierConfig::routes`].
    fn route_key(&self) -> String {
        format!("{}:{}", self.method, self.path)
    }
}

/// Top-level configuration for a [`MultiTierLimiter`].
#[derive(Clone)]
pub struct MultiTierConfig {
    pub name: String,
    pub global_rate: f64,
    pub global_burst: u64,
    pub default_route: RouteConfig,
    pub default_resource_rate: f64,
    pub default_resource_burst: u64,
    pub routes: HashMap<String, RouteConfig>,
    pub bucket_ttl: Duration,
    pub bucket_mapping_enabled: bool,
    pub jitter_factor: f64,
    pub observability: Observability,
}

impl MultiTierConfig {
    pub fn new(name: impl Into<String>, global_rate: f64, global_burst: u64) -> Self {
        Self {
            name: name.into(),
            global_rate,
            global_burst,
            default_route: RouteConfig::new(global_rate, global_burst),
            default_resource_rate: 0.0,
            default_resource_burst: 0,
            routes: HashMap::new(),
            bucket_ttl: Duration::from_secs(300),
            bucket_mapping_enabled: false,
            jitter_factor: 0.1,
            observability: Observability::default(),
        }
    }

    #[must_use]
    pub fn with_route(mut self, pattern: impl Into<String>, route: RouteConfig) -> Self {
        self.routes.insert(pattern.into(), route);
        self
    }

    #[must_use]
    pub fn with_default_resource_limit(mut self, rate: f64, burst: u64) -> Self {
        self.default_resource_rate = rate;
        self.default_resource_burst = burst;
        self
    }

    #[must_use]
    pub fn with_bucket_mapping_enabled(mut self, enabled: bool) -> Self {
        self.bucket_mapping_enabled = enabled;
        self
    }
}

struct Entry {
    bucket: Arc<TokenBucket>,
    last_used: Instant,
}

/// State kept for a header-derived named bucket (`X-RateLimit-*`).
#[derive(Debug, Clone, Default)]
struct HeaderBucketState {
    limit: Option<u64>,
    remaining: Option<u64>,
    reset_after: Option<Duration>,
    global: bool,
}

/// Response headers recognised by [`MultiTierLimiter::update_from_headers`]. Only
/// this set; no vendor-specific extension is added (see `SPEC_FULL.md` §9).
#[derive(Debug, Clone, Default)]
pub struct RateLimitHeaders {
    pub bucket: Option<String>,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_after: Option<Duration>,
    pub global: bool,
}

/// Snapshot of [`MultiTierLimiter`] activity.
#[derive(Debug, Clone, Default)]
pub struct MultiTierMetrics {
    pub allowed_total: u64,
    pub global_denied_total: u64,
    pub route_denied_total: u64,
    pub resource_denied_total: u64,
    pub bucket_denied_total: u64,
    pub active_route_buckets: usize,
    pub active_resource_buckets: usize,
}

/// Cascades a [`Request`] through global, route, and resource sub-limiters, each a
/// lazily-created [`TokenBucket`] evicted after `bucket_ttl` of inactivity.
pub struct MultiTierLimiter {
    name: String,
    clock: Arc<dyn Clock>,
    global: TokenBucket,
    default_route: RouteConfig,
    default_resource_rate: f64,
    default_resource_burst: u64,
    routes: HashMap<String, RouteConfig>,
    route_buckets: Mutex<HashMap<String, Entry>>,
    resource_buckets: Mutex<HashMap<String, Entry>>,
    header_buckets: Mutex<HashMap<String, HeaderBucketState>>,
    bucket_mapping_enabled: bool,
    bucket_ttl: Duration,
    jitter_factor: f64,
    observability: Observability,
    metrics: Mutex<MultiTierMetrics>,
}

impl MultiTierLimiter {
    pub fn new(config: MultiTierConfig, clock: Arc<dyn Clock>) -> Self {
        let global = TokenBucket::new(
            RateLimiterConfig::new(format!("{}.global", config.name), config.global_rate, config.global_burst)
                .with_jitter_factor(config.jitter_factor)
                .with_observability(config.observability.clone()),
            clock.clone(),
        );
        Self {
            name: config.name,
            clock,
            global,
            default_route: config.default_route,
            default_resource_rate: config.default_resource_rate,
            default_resource_burst: config.default_resource_burst,
            routes: config.routes,
            route_buckets: Mutex::new(HashMap::new()),
            resource_buckets: Mutex::new(HashMap::new()),
            header_buckets: Mutex::new(HashMap::new()),
            bucket_mapping_enabled: config.bucket_mapping_enabled,
            bucket_ttl: config.bucket_ttl,
            jitter_factor: config.jitter_factor,
            observability: config.observability,
            metrics: Mutex::new(MultiTierMetrics::default()),
        }
    }

    /// Non-blocking: global, then route, then resource, then header-derived bucket.
    /// All tiers must admit for the request to pass.
    pub fn allow(&self, req: &Request) -> bool {
        if !self.global.allow(1) {
            self.metrics.lock().global_denied_total += 1;
            return false;
        }
        let route = self.route_bucket(req);
        if !route.allow(1) {
            self.metrics.lock().route_denied_total += 1;
            return false;
        }
        if let Some(resource) = self.resource_bucket(req) {
            if !resource.allow(1) {
                self.metrics.lock().resource_denied_total += 1;
                return false;
            }
        }
        if self.bucket_mapping_enabled && !self.header_bucket_allow(req) {
            self.metrics.lock().bucket_denied_total += 1;
            return false;
        }
        self.metrics.lock().allowed_total += 1;
        true
    }

    /// Blocking variant: waits on each tier in turn, never holding a sub-limiter's
    /// lock across a wait.
    pub fn wait(&self, token: &CancellationToken, req: &Request) -> Result<()> {
        self.global.wait(token, 1).map_err(|e| self.tier_err(e, ErrorKind::GlobalLimit))?;
        let route = self.route_bucket(req);
        route.wait(token, 1).map_err(|e| self.tier_err(e, ErrorKind::RateLimitExceeded))?;
        if let Some(resource) = self.resource_bucket(req) {
            resource.wait(token, 1).map_err(|e| self.tier_err(e, ErrorKind::RateLimitExceeded))?;
        }
        if self.bucket_mapping_enabled && !self.header_bucket_allow(req) {
            return Err(Error::new(ErrorKind::BucketLimit, self.name.clone(), "wait"));
        }
        self.metrics.lock().allowed_total += 1;
        Ok(())
    }

    /// Ingest the recognised rate-limit response headers and associate `req`'s
    /// resolved bucket key with the resulting state, so a subsequent `allow`/`wait`
    /// for the same key can fail fast with `BucketLimit` once exhausted.
    pub fn update_from_headers(&self, req: &Request, headers: &RateLimitHeaders) {
        if !self.bucket_mapping_enabled {
            return;
        }
        let Some(bucket_name) = &headers.bucket else { return };
        let mut buckets = self.header_buckets.lock();
        let entry = buckets.entry(bucket_name.clone()).or_default();
        if let Some(limit) = headers.limit {
            entry.limit = Some(limit);
        }
        if let Some(remaining) = headers.remaining {
            entry.remaining = Some(remaining);
        }
        if let Some(reset_after) = headers.reset_after {
            entry.reset_after = Some(reset_after);
        }
        entry.global = headers.global;
        drop(buckets);
        // Associate this request's route key with the named bucket for subsequent
        // lookups (kept alongside the route bucket map for eviction consistency).
        self.header_bucket_alias(&req.route_key(), bucket_name);
    }

    fn header_bucket_alias(&self, route_key: &str, bucket_name: &str) {
        let mut buckets = self.header_buckets.lock();
        if let Some(state) = buckets.get(bucket_name).cloned() {
            buckets.insert(route_key.to_string(), state);
        }
    }

    fn header_bucket_allow(&self, req: &Request) -> bool {
        let mut buckets = self.header_buckets.lock();
        let Some(state) = buckets.get_mut(&req.route_key()) else { return true };
        match state.remaining {
            Some(0) => false,
            Some(remaining) => {
                state.remaining = Some(remaining - 1);
                true
            }
            None => true,
        }
    }

    pub fn metrics(&self) -> MultiTierMetrics {
        let mut m = self.metrics.lock().clone();
        m.active_route_buckets = self.route_buckets.lock().len();
        m.active_resource_buckets = self.resource_buckets.lock().len();
        m
    }

    fn route_bucket(&self, req: &Request) -> Arc<TokenBucket> {
        let route_config = self.routes.get(&self.route_pattern(req)).cloned().unwrap_or_else(|| self.default_route.clone());
        let key = self.route_bucket_key(req, &route_config);
        self.fetch_or_create(&self.route_buckets, &key, route_config.rate, route_config.burst, "route")
    }

    fn resource_bucket(&self, req: &Request) -> Option<Arc<TokenBucket>> {
        let resource_id = req.resource_id.as_ref()?;
        if self.default_resource_rate <= 0.0 {
            return None;
        }
        Some(self.fetch_or_create(&self.resource_buckets, resource_id, self.default_resource_rate, self.default_resource_burst, "resource"))
    }

    fn route_pattern(&self, req: &Request) -> String {
        req.route_key()
    }

    fn route_bucket_key(&self, req: &Request, route: &RouteConfig) -> String {
        let mut key = self.route_pattern(req);
        for param_key in &route.major_parameter_keys {
            if let Some(value) = req.major_parameters.get(param_key) {
                key.push('|');
                key.push_str(param_key);
                key.push('=');
                key.push_str(value);
            }
        }
        key
    }

    fn fetch_or_create(&self, map: &Mutex<HashMap<String, Entry>>, key: &str, rate: f64, burst: u64, tier: &'static str) -> Arc<TokenBucket> {
        let now = self.clock.now();
        let mut map_guard = map.lock();
        map_guard.retain(|_, entry| now.saturating_duration_since(entry.last_used) < self.bucket_ttl);
        if let Some(entry) = map_guard.get_mut(key) {
            entry.last_used = now;
            return entry.bucket.clone();
        }
        let bucket = Arc::new(TokenBucket::new(
            RateLimiterConfig::new(format!("{}.{}.{}", self.name, tier, key), rate, burst)
                .with_jitter_factor(self.jitter_factor)
                .with_observability(self.observability.clone()),
            self.clock.clone(),
        ));
        map_guard.insert(key.to_string(), Entry { bucket: bucket.clone(), last_used: now });
        bucket
    }

    fn tier_err(&self, e: Error, kind: ErrorKind) -> Error {
        if matches!(e.kind(), ErrorKind::Cancelled | ErrorKind::AcquireTimeout) {
            e
        } else {
            Error::new(kind, self.name.clone(), e.operation())
        }
    }
}
