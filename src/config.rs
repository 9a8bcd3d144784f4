//! Server configuration management with validation and layered loading
//!
//! Configuration is assembled from built-in defaults, an optional TOML file
//! and `FAIRWAY_`-prefixed environment variables, then validated before the
//! server starts. A missing master encryption key or upstream API key outside
//! dev mode is a fatal startup error.

use crate::cache::tier::EvictionPolicy;
use crate::error::{ProxyError, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use validator::Validate;

/// Main proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProxyConfig {
    #[validate(nested)]
    pub server: ServerSettings,

    #[validate(nested)]
    pub upstream: UpstreamSettings,

    #[validate(nested)]
    pub cache: CacheSettings,

    #[validate(nested)]
    pub session: SessionSettings,

    #[validate(nested)]
    pub rate_limit: RateLimitSettings,

    #[validate(nested)]
    pub breaker: BreakerSettings,

    #[validate(nested)]
    pub ttl: TtlSettings,

    #[validate(nested)]
    pub metrics: MetricsSettings,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerSettings {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,

    #[validate(range(min = 1))]
    pub graceful_shutdown_timeout_secs: u64,

    pub cors: bool,

    /// Relaxes startup checks and includes error detail in responses
    pub dev_mode: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 60,
            graceful_shutdown_timeout_secs: 30,
            cors: true,
            dev_mode: false,
        }
    }
}

/// Upstream data feed settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpstreamSettings {
    #[validate(url)]
    pub base_url: String,

    /// Vendor API key, appended as the `key` query parameter. Never logged.
    pub api_key: String,

    #[validate(range(min = 1))]
    pub attempt_timeout_secs: u64,

    #[validate(range(max = 10))]
    pub max_retries: u32,

    #[validate(range(min = 1))]
    pub base_delay_ms: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: "https://feeds.datagolf.com".to_string(),
            api_key: String::new(),
            attempt_timeout_secs: 30,
            max_retries: 3,
            base_delay_ms: 250,
        }
    }
}

impl UpstreamSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// One cache tier's settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TierSettings {
    pub enabled: bool,

    #[validate(range(min = 1))]
    pub max_size: usize,

    #[validate(range(min = 1))]
    pub default_ttl_secs: u64,

    pub policy: EvictionPolicy,
}

impl TierSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Tiered cache settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheSettings {
    #[validate(nested)]
    pub l1: TierSettings,

    #[validate(nested)]
    pub l2: TierSettings,

    #[validate(nested)]
    pub l3: TierSettings,

    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            l1: TierSettings {
                enabled: true,
                max_size: 1000,
                default_ttl_secs: 300, // 5 minutes
                policy: EvictionPolicy::Lru,
            },
            l2: TierSettings {
                enabled: true,
                max_size: 5000,
                default_ttl_secs: 1800, // 30 minutes
                policy: EvictionPolicy::Fifo,
            },
            l3: TierSettings {
                enabled: true,
                max_size: 20000,
                default_ttl_secs: 86400, // 24 hours
                policy: EvictionPolicy::Lfu,
            },
            sweep_interval_secs: 300,
        }
    }
}

/// Session envelope settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SessionSettings {
    /// Master key for PBKDF2 derivation. Required outside dev mode.
    pub master_key: String,

    #[validate(range(min = 60))]
    pub timeout_secs: u64,

    #[validate(range(min = 3600))]
    pub max_age_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            master_key: String::new(),
            timeout_secs: 1800,      // 30 minutes sliding
            max_age_secs: 7 * 86400, // 7 days absolute
        }
    }
}

impl SessionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Per-endpoint rate limit override
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EndpointLimit {
    #[validate(range(min = 1))]
    pub limit: u32,

    #[validate(range(min = 1))]
    pub window_secs: u64,
}

/// Rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RateLimitSettings {
    #[validate(range(min = 1))]
    pub default_limit: u32,

    #[validate(range(min = 1))]
    pub default_window_secs: u64,

    pub endpoints: HashMap<String, EndpointLimit>,

    #[validate(range(min = 1))]
    pub housekeeping_interval_secs: u64,

    pub adaptive: AdaptiveSettings,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_limit: 100,
            default_window_secs: 60,
            endpoints: HashMap::new(),
            housekeeping_interval_secs: 60,
            adaptive: AdaptiveSettings::default(),
        }
    }
}

/// Adaptive rate limit supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Lower clamp applied to scaled limits
    pub min_limit: u32,
    /// Upper clamp applied to scaled limits
    pub max_limit: u32,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 60,
            min_limit: 10,
            max_limit: 1000,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BreakerSettings {
    #[validate(range(min = 1))]
    pub failure_threshold: u32,

    #[validate(range(min = 1))]
    pub open_timeout_secs: u64,

    #[validate(range(min = 1))]
    pub half_open_max_trials: u32,

    #[validate(range(min = 1))]
    pub reset_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_secs: 60,
            half_open_max_trials: 5,
            reset_threshold: 3,
        }
    }
}

impl BreakerSettings {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

/// Cache TTL selection settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TtlSettings {
    /// Base TTL for live scoring and betting odds
    #[validate(range(min = 1))]
    pub realtime_secs: u64,

    /// Base TTL for field and rankings
    #[validate(range(min = 1))]
    pub dynamic_secs: u64,

    /// Base TTL for tournaments and historical stats
    #[validate(range(min = 1))]
    pub reference_secs: u64,

    #[validate(range(min = 1))]
    pub min_secs: u64,

    #[validate(range(min = 1))]
    pub max_secs: u64,
}

impl Default for TtlSettings {
    fn default() -> Self {
        Self {
            realtime_secs: 60,
            dynamic_secs: 1200,    // 20 minutes
            reference_secs: 21600, // 6 hours
            min_secs: 30,
            max_secs: 86400,
        }
    }
}

/// Metrics aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MetricsSettings {
    /// Rolling window length for response time and error rate
    #[validate(range(min = 10))]
    pub window_secs: u64,

    /// Error rate above which an alert is logged (0.0..=1.0)
    pub error_rate_alert: f64,

    /// Average latency above which an alert is logged
    pub latency_alert_ms: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            window_secs: 300, // 5 minutes
            error_rate_alert: 0.25,
            latency_alert_ms: 5000,
        }
    }
}

impl MetricsSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            upstream: UpstreamSettings::default(),
            cache: CacheSettings::default(),
            session: SessionSettings::default(),
            rate_limit: RateLimitSettings::default(),
            breaker: BreakerSettings::default(),
            ttl: TtlSettings::default(),
            metrics: MetricsSettings::default(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from defaults, an optional TOML file, and
    /// `FAIRWAY_`-prefixed environment variables (`FAIRWAY_SERVER__PORT=9090`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ProxyConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ProxyError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("fairway.toml"));
        }

        let config: ProxyConfig = figment
            .merge(Env::prefixed("FAIRWAY_").split("__"))
            .extract()
            .map_err(|e| ProxyError::Config(e.to_string()))?;

        config.validate_startup()?;
        Ok(config)
    }

    /// Validate field constraints and required secrets
    pub fn validate_startup(&self) -> Result<()> {
        self.validate()
            .map_err(|e| ProxyError::Config(e.to_string()))?;

        if self.ttl.min_secs > self.ttl.max_secs {
            return Err(ProxyError::Config(
                "ttl.min_secs must not exceed ttl.max_secs".to_string(),
            ));
        }

        if self.session.master_key.is_empty() {
            if self.server.dev_mode {
                warn!("no session master key configured; dev mode will derive an ephemeral one");
            } else {
                return Err(ProxyError::Config(
                    "session.master_key is required outside dev mode".to_string(),
                ));
            }
        }

        if self.upstream.api_key.is_empty() {
            if self.server.dev_mode {
                warn!("no upstream API key configured; upstream fetches will be rejected");
            } else {
                return Err(ProxyError::Config(
                    "upstream.api_key is required outside dev mode".to_string(),
                ));
            }
        }

        info!(
            host = %self.server.host,
            port = self.server.port,
            "configuration loaded"
        );
        Ok(())
    }

    /// Effective `(limit, window)` for an endpoint
    pub fn rate_limit_for(&self, endpoint: &str) -> (u32, Duration) {
        match self.rate_limit.endpoints.get(endpoint) {
            Some(o) => (o.limit, Duration::from_secs(o.window_secs)),
            None => (
                self.rate_limit.default_limit,
                Duration::from_secs(self.rate_limit.default_window_secs),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate_in_dev_mode() {
        let mut config = ProxyConfig::default();
        config.server.dev_mode = true;
        assert!(config.validate_startup().is_ok());
    }

    #[test]
    fn test_missing_master_key_is_fatal() {
        let config = ProxyConfig::default();
        assert!(!config.server.dev_mode);
        let err = config.validate_startup().unwrap_err();
        assert!(err.to_string().contains("master_key"));
    }

    #[test]
    fn test_endpoint_override_lookup() {
        let mut config = ProxyConfig::default();
        config.rate_limit.endpoints.insert(
            "scoring".to_string(),
            EndpointLimit {
                limit: 20,
                window_secs: 10,
            },
        );
        let (limit, window) = config.rate_limit_for("scoring");
        assert_eq!(limit, 20);
        assert_eq!(window, Duration::from_secs(10));

        let (limit, window) = config.rate_limit_for("tournaments");
        assert_eq!(limit, 100);
        assert_eq!(window, Duration::from_secs(60));
    }

    #[test]
    fn test_ttl_bounds_checked() {
        let mut config = ProxyConfig::default();
        config.server.dev_mode = true;
        config.ttl.min_secs = 100;
        config.ttl.max_secs = 50;
        assert!(config.validate_startup().is_err());
    }
}
