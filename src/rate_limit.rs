//! Sliding-window rate limiting per (identity, endpoint)
//!
//! Identity is the session id, falling back to the client IP when no session
//! exists. Each window holds the monotonic timestamps of recent admissions;
//! counting is exact over the trailing window, not bucketed.

use crate::config::RateLimitSettings;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of a rate-limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Admissions left in the current window after this decision
    pub remaining: u32,
    /// Present when denied: seconds until a slot frees up
    pub retry_after_secs: Option<u64>,
    pub limit: u32,
}

#[derive(Debug)]
struct Window {
    admitted: VecDeque<Instant>,
    last_seen: Instant,
}

impl Window {
    fn new() -> Self {
        Self {
            admitted: VecDeque::new(),
            last_seen: Instant::now(),
        }
    }
}

/// Sliding-window limiter with per-endpoint overrides and adaptive scaling
pub struct RateLimiter {
    settings: RateLimitSettings,
    windows: DashMap<(String, String), Window>,
    /// Endpoint → adaptively scaled limit, when the supervisor is active
    effective_limits: DashMap<String, u32>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            windows: DashMap::new(),
            effective_limits: DashMap::new(),
        }
    }

    fn limit_for(&self, endpoint: &str) -> (u32, Duration) {
        let (configured, window) = match self.settings.endpoints.get(endpoint) {
            Some(o) => (o.limit, Duration::from_secs(o.window_secs)),
            None => (
                self.settings.default_limit,
                Duration::from_secs(self.settings.default_window_secs),
            ),
        };
        let limit = self
            .effective_limits
            .get(endpoint)
            .map(|l| *l)
            .unwrap_or(configured);
        (limit, window)
    }

    /// Check and record an admission for `(identity, endpoint)`
    pub fn allow(&self, identity: &str, endpoint: &str) -> RateDecision {
        let (limit, window) = self.limit_for(endpoint);
        let now = Instant::now();

        let mut entry = self
            .windows
            .entry((identity.to_string(), endpoint.to_string()))
            .or_insert_with(Window::new);

        entry.last_seen = now;
        while let Some(front) = entry.admitted.front() {
            if now.duration_since(*front) >= window {
                entry.admitted.pop_front();
            } else {
                break;
            }
        }

        let used = entry.admitted.len() as u32;
        if used < limit {
            entry.admitted.push_back(now);
            RateDecision {
                allowed: true,
                remaining: limit - used - 1,
                retry_after_secs: None,
                limit,
            }
        } else {
            let retry_after = entry
                .admitted
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            debug!(identity, endpoint, limit, "rate limit denied");
            RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: Some(retry_after.as_secs().max(1)),
                limit,
            }
        }
    }

    /// Drop windows idle for longer than twice their window length
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|(_, endpoint), window| {
            let (_, window_len) = match self.settings.endpoints.get(endpoint) {
                Some(o) => (o.limit, Duration::from_secs(o.window_secs)),
                None => (
                    self.settings.default_limit,
                    Duration::from_secs(self.settings.default_window_secs),
                ),
            };
            now.duration_since(window.last_seen) < window_len * 2
        });
        before - self.windows.len()
    }

    /// Scale one endpoint's limit by `factor`, clamped to the configured
    /// bounds. Called by the adaptive supervisor for each endpoint.
    pub fn apply_factor(&self, endpoint: &str, factor: f64) {
        let configured = self
            .settings
            .endpoints
            .get(endpoint)
            .map(|o| o.limit)
            .unwrap_or(self.settings.default_limit);
        let scaled = ((configured as f64) * factor).round() as u32;
        let clamped = scaled.clamp(
            self.settings.adaptive.min_limit,
            self.settings.adaptive.max_limit,
        );
        self.effective_limits.insert(endpoint.to_string(), clamped);
        info!(endpoint, factor, limit = clamped, "adaptive rate limit applied");
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }

    /// Spawn the periodic empty-window reaper
    pub fn start_housekeeping(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        let interval = Duration::from_secs(self.settings.housekeeping_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pruned = limiter.prune();
                if pruned > 0 {
                    debug!(pruned, "rate limiter pruned idle windows");
                }
            }
        });
    }
}

/// Maps a 0.0..=1.0 performance score to a limit scale factor
pub fn adjustment_factor(score: f64) -> f64 {
    if score >= 0.9 {
        1.25
    } else if score >= 0.7 {
        1.0
    } else if score >= 0.5 {
        0.75
    } else {
        0.5
    }
}
