//! HTTP server assembly
//!
//! Builds the axum router over the request pipeline, wires the background
//! maintenance tasks (cache sweep, rate-window pruning, adaptive limit
//! supervision), and runs with graceful shutdown.

pub mod handlers;

use crate::breaker::CircuitBreaker;
use crate::cache::TieredCache;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::metrics::MetricsAggregator;
use crate::pipeline::RequestPipeline;
use crate::rate_limit::{adjustment_factor, RateLimiter};
use crate::session::SessionEnvelope;
use crate::transform::TransformerRegistry;
use crate::upstream::{DataFeedClient, UpstreamFetcher};
use axum::{
    routing::{get, post},
    Router,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
    pub config: Arc<ProxyConfig>,
    pub started_at: Instant,
}

/// The assembled proxy server
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    pipeline: Arc<RequestPipeline>,
}

/// Builder for [`ProxyServer`]; tests inject a scripted fetcher here
pub struct ProxyServerBuilder {
    config: ProxyConfig,
    upstream: Option<Arc<dyn UpstreamFetcher>>,
}

impl ProxyServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::default(),
            upstream: None,
        }
    }

    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn upstream(mut self, upstream: Arc<dyn UpstreamFetcher>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn build(self) -> Result<ProxyServer> {
        let config = Arc::new(self.config);

        let cache = Arc::new(TieredCache::new(&config.cache));
        let sessions = Arc::new(SessionEnvelope::new(config.session.clone())?);
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let upstream: Arc<dyn UpstreamFetcher> = match self.upstream {
            Some(upstream) => upstream,
            None => Arc::new(DataFeedClient::new(config.upstream.clone())?),
        };
        let transformers = Arc::new(TransformerRegistry::with_defaults());
        let metrics = Arc::new(MetricsAggregator::new(config.metrics.clone()));

        let pipeline = Arc::new(RequestPipeline::new(
            Arc::clone(&config),
            cache,
            sessions,
            limiter,
            breaker,
            upstream,
            transformers,
            metrics,
        ));

        Ok(ProxyServer { config, pipeline })
    }
}

impl Default for ProxyServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyServer {
    pub fn builder() -> ProxyServerBuilder {
        ProxyServerBuilder::new()
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    /// Build the router with middleware layers applied
    pub fn router(&self) -> Router {
        let state = AppState {
            pipeline: Arc::clone(&self.pipeline),
            config: Arc::clone(&self.config),
            started_at: Instant::now(),
        };

        let mut router = Router::new()
            .route(
                "/proxy/*endpoint",
                get(handlers::proxy_get).post(handlers::proxy_post),
            )
            .route("/health", get(handlers::health))
            .route("/admin/stats", get(handlers::stats))
            .route("/admin/cache/stats", get(handlers::cache_stats))
            .route("/admin/cache/invalidate", post(handlers::invalidate_cache))
            .route("/admin/breakers", get(handlers::breakers))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(Duration::from_secs(
                        self.config.server.request_timeout_secs,
                    ))),
            );

        if self.config.server.cors {
            router = router.layer(CorsLayer::permissive());
        }
        router
    }

    /// Start background maintenance and serve until shutdown
    pub async fn run(self) -> Result<()> {
        self.start_background_tasks();

        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Config(format!("cannot bind {addr}: {e}")))?;
        info!(addr, "proxy listening");

        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| ProxyError::Internal(format!("server error: {e}")))?;

        info!("shutdown complete");
        Ok(())
    }

    fn start_background_tasks(&self) {
        let cache_interval = Duration::from_secs(self.config.cache.sweep_interval_secs);
        self.pipeline.cache().start_sweeper(cache_interval);
        self.pipeline.limiter().start_housekeeping();

        if self.config.rate_limit.adaptive.enabled {
            self.start_adaptive_supervisor();
        }
    }

    /// Periodically rescale every observed endpoint's rate limit from the
    /// blended performance score.
    fn start_adaptive_supervisor(&self) {
        let metrics = Arc::clone(self.pipeline.metrics());
        let limiter = Arc::clone(self.pipeline.limiter());
        let breaker = Arc::clone(self.pipeline.breaker());
        let configured: Vec<String> = self
            .config
            .rate_limit
            .endpoints
            .keys()
            .cloned()
            .collect();
        let interval = Duration::from_secs(self.config.rate_limit.adaptive.interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let score = metrics.performance_score();
                let factor = adjustment_factor(score);

                let mut endpoints: HashSet<String> = configured.iter().cloned().collect();
                for endpoint in metrics.snapshot(breaker.transition_count()).endpoints.keys() {
                    endpoints.insert(endpoint.clone());
                }
                for endpoint in endpoints {
                    limiter.apply_factor(&endpoint, factor);
                }
                debug!(score, factor, "adaptive rate supervision tick");
            }
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
