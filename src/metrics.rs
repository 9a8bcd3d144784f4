//! Request metrics aggregation
//!
//! Per-endpoint counters plus a rolling sample window for response times and
//! error rates. Updates happen on the request path and must stay cheap: each
//! record touches one map entry under a short shard lock and never awaits.

use crate::config::MetricsSettings;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// How a request was satisfied, for accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Served from cache at the given 1-based tier level
    CacheHit(usize),
    /// Fetched fresh from the upstream
    Fetched,
    /// Served an expired body because the upstream was unreachable
    StaleServe,
    /// Failed with the given HTTP status
    Error(u16),
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    latency: Duration,
    success: bool,
    cache_hit: bool,
}

#[derive(Debug, Default)]
struct EndpointStats {
    requests: u64,
    hits_l1: u64,
    hits_l2: u64,
    hits_l3: u64,
    misses: u64,
    stale_serves: u64,
    errors_by_code: HashMap<u16, u64>,
    bytes_out: u64,
    rate_limit_denials: u64,
    samples: VecDeque<Sample>,
}

impl EndpointStats {
    fn trim(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) >= window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Rolling-window view for one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub samples: usize,
    pub avg_response_ms: f64,
    pub error_rate: f64,
    pub hits_per_hour: f64,
}

/// One endpoint's full report
#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub requests: u64,
    pub hits_l1: u64,
    pub hits_l2: u64,
    pub hits_l3: u64,
    pub misses: u64,
    pub stale_serves: u64,
    pub hit_rate: f64,
    pub errors_by_code: HashMap<u16, u64>,
    pub bytes_out: u64,
    pub rate_limit_denials: u64,
    pub window: WindowReport,
}

/// Point-in-time snapshot across all endpoints
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub breaker_transitions: u64,
    pub endpoints: HashMap<String, EndpointReport>,
}

/// One time bucket of aggregated samples
#[derive(Debug, Clone, Serialize)]
pub struct BucketReport {
    /// Seconds back from now to the bucket's start
    pub offset_secs: u64,
    pub count: usize,
    pub avg_response_ms: f64,
    pub errors: usize,
}

/// Aggregates counters and rolling windows per endpoint
pub struct MetricsAggregator {
    settings: MetricsSettings,
    endpoints: DashMap<String, EndpointStats>,
    /// Millisecond epoch of the last alert, for cooldown
    last_alert_ms: AtomicU64,
}

impl MetricsAggregator {
    pub fn new(settings: MetricsSettings) -> Self {
        Self {
            settings,
            endpoints: DashMap::new(),
            last_alert_ms: AtomicU64::new(0),
        }
    }

    /// Record one finished request
    pub fn record_request(
        &self,
        endpoint: &str,
        latency: Duration,
        outcome: RequestOutcome,
        bytes_out: usize,
    ) {
        let window = self.settings.window();
        {
            let mut stats = self.endpoints.entry(endpoint.to_string()).or_default();
            stats.requests += 1;
            stats.bytes_out += bytes_out as u64;

            let (success, cache_hit) = match outcome {
                RequestOutcome::CacheHit(1) => {
                    stats.hits_l1 += 1;
                    (true, true)
                }
                RequestOutcome::CacheHit(2) => {
                    stats.hits_l2 += 1;
                    (true, true)
                }
                RequestOutcome::CacheHit(_) => {
                    stats.hits_l3 += 1;
                    (true, true)
                }
                RequestOutcome::Fetched => {
                    stats.misses += 1;
                    (true, false)
                }
                RequestOutcome::StaleServe => {
                    stats.stale_serves += 1;
                    (true, false)
                }
                RequestOutcome::Error(code) => {
                    *stats.errors_by_code.entry(code).or_default() += 1;
                    (false, false)
                }
            };

            stats.samples.push_back(Sample {
                at: Instant::now(),
                latency,
                success,
                cache_hit,
            });
            stats.trim(window);
        }

        self.maybe_alert(endpoint);
    }

    pub fn record_denial(&self, endpoint: &str) {
        let mut stats = self.endpoints.entry(endpoint.to_string()).or_default();
        stats.rate_limit_denials += 1;
    }

    fn report(&self, stats: &mut EndpointStats) -> EndpointReport {
        stats.trim(self.settings.window());

        let hits = stats.hits_l1 + stats.hits_l2 + stats.hits_l3;
        let lookups = hits + stats.misses;
        let hit_rate = if lookups > 0 {
            hits as f64 / lookups as f64
        } else {
            0.0
        };

        let samples = stats.samples.len();
        let (mut total_ms, mut errors, mut window_hits) = (0.0, 0usize, 0usize);
        for sample in &stats.samples {
            total_ms += sample.latency.as_secs_f64() * 1000.0;
            if !sample.success {
                errors += 1;
            }
            if sample.cache_hit {
                window_hits += 1;
            }
        }
        let avg_response_ms = if samples > 0 {
            total_ms / samples as f64
        } else {
            0.0
        };
        let error_rate = if samples > 0 {
            errors as f64 / samples as f64
        } else {
            0.0
        };
        let hits_per_hour =
            window_hits as f64 * 3600.0 / self.settings.window().as_secs().max(1) as f64;

        EndpointReport {
            requests: stats.requests,
            hits_l1: stats.hits_l1,
            hits_l2: stats.hits_l2,
            hits_l3: stats.hits_l3,
            misses: stats.misses,
            stale_serves: stats.stale_serves,
            hit_rate,
            errors_by_code: stats.errors_by_code.clone(),
            bytes_out: stats.bytes_out,
            rate_limit_denials: stats.rate_limit_denials,
            window: WindowReport {
                samples,
                avg_response_ms,
                error_rate,
                hits_per_hour,
            },
        }
    }

    /// Snapshot across all endpoints. The circuit breaker owns its
    /// transition counter, so the caller supplies it.
    pub fn snapshot(&self, breaker_transitions: u64) -> MetricsSnapshot {
        let mut endpoints = HashMap::new();
        for mut entry in self.endpoints.iter_mut() {
            let endpoint = entry.key().clone();
            let report = self.report(entry.value_mut());
            endpoints.insert(endpoint, report);
        }
        MetricsSnapshot {
            generated_at: Utc::now(),
            breaker_transitions,
            endpoints,
        }
    }

    /// One endpoint's report, if any traffic was seen
    pub fn endpoint_report(&self, endpoint: &str) -> Option<EndpointReport> {
        self.endpoints
            .get_mut(endpoint)
            .map(|mut entry| self.report(entry.value_mut()))
    }

    /// Recent cache hits per hour for an endpoint, extrapolated from the
    /// rolling window. Drives the TTL frequency factor.
    pub fn hits_per_hour(&self, endpoint: &str) -> f64 {
        self.endpoint_report(endpoint)
            .map(|r| r.window.hits_per_hour)
            .unwrap_or(0.0)
    }

    /// Aggregate the rolling window into fixed-size time buckets,
    /// most recent first.
    pub fn latency_buckets(&self, endpoint: &str, bucket: Duration) -> Vec<BucketReport> {
        let Some(mut entry) = self.endpoints.get_mut(endpoint) else {
            return Vec::new();
        };
        entry.trim(self.settings.window());

        let bucket = bucket.max(Duration::from_secs(1));
        let bucket_count =
            (self.settings.window().as_secs() / bucket.as_secs()).max(1) as usize;
        let now = Instant::now();

        let mut totals = vec![(0usize, 0.0f64, 0usize); bucket_count];
        for sample in &entry.samples {
            let age = now.duration_since(sample.at);
            let index = (age.as_secs() / bucket.as_secs()) as usize;
            if let Some(slot) = totals.get_mut(index) {
                slot.0 += 1;
                slot.1 += sample.latency.as_secs_f64() * 1000.0;
                if !sample.success {
                    slot.2 += 1;
                }
            }
        }

        totals
            .into_iter()
            .enumerate()
            .map(|(index, (count, total_ms, errors))| BucketReport {
                offset_secs: index as u64 * bucket.as_secs(),
                count,
                avg_response_ms: if count > 0 { total_ms / count as f64 } else { 0.0 },
                errors,
            })
            .collect()
    }

    /// Blended health score in 0.0..=1.0 for the adaptive rate limiter:
    /// weighted error rate, cache hit rate, and latency headroom.
    pub fn performance_score(&self) -> f64 {
        let snapshot = self.snapshot(0);
        if snapshot.endpoints.is_empty() {
            return 1.0;
        }

        let mut total = 0.0;
        for report in snapshot.endpoints.values() {
            let latency_headroom = 1.0
                - (report.window.avg_response_ms / self.settings.latency_alert_ms as f64).min(1.0);
            let score = 0.4 * (1.0 - report.window.error_rate)
                + 0.3 * report.hit_rate
                + 0.3 * latency_headroom;
            total += score;
        }
        (total / snapshot.endpoints.len() as f64).clamp(0.0, 1.0)
    }

    fn maybe_alert(&self, endpoint: &str) {
        let Some(report) = self.endpoint_report(endpoint) else {
            return;
        };
        if report.window.samples < 10 {
            return;
        }

        let error_breach = report.window.error_rate > self.settings.error_rate_alert;
        let latency_breach =
            report.window.avg_response_ms > self.settings.latency_alert_ms as f64;
        if !error_breach && !latency_breach {
            return;
        }

        // One alert per minute at most
        let now_ms = Utc::now().timestamp_millis() as u64;
        let last = self.last_alert_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < 60_000 {
            return;
        }
        if self
            .last_alert_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        warn!(
            endpoint,
            error_rate = report.window.error_rate,
            avg_response_ms = report.window.avg_response_ms,
            "endpoint health alert"
        );
    }
}
