//! Request processing pipeline
//!
//! Composes the session envelope, rate limiter, circuit breaker, tiered
//! cache, single-flight coordinator, upstream client, and transformer
//! registry into one `process()` call, and assembles the response envelope.
//!
//! Flow per request: refresh session → rate limit → cache probe → breaker
//! admit → single-flight fetch (retry, transform, TTL, write-back) → metrics.
//! When the upstream is unreachable, an expired cached body is preferred
//! over an error (stale-serve).

use crate::breaker::CircuitBreaker;
use crate::cache::{derive_cache_key, CacheHit, TieredCache};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::metrics::{MetricsAggregator, RequestOutcome};
use crate::rate_limit::RateLimiter;
use crate::session::SessionEnvelope;
use crate::single_flight::SingleFlight;
use crate::transform::TransformerRegistry;
use crate::upstream::UpstreamFetcher;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An inbound proxy request, already parsed off the HTTP surface
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub endpoint: String,
    pub params: HashMap<String, String>,
    /// Headers forwarded to the upstream
    pub forward_headers: HashMap<String, String>,
    pub session_token: Option<String>,
    pub client_ip: String,
    pub user_agent: String,
    /// Skip the cache read path (the result is still stored)
    pub cache_override: bool,
    /// Named per-request transformation overrides
    pub transformations: Vec<String>,
    pub request_id: String,
    pub correlation_id: String,
}

/// Cache disposition for the `X-Cache-Status` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Stale => "STALE",
        }
    }
}

/// Error payload inside the response envelope
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Rate limit metadata inside the response envelope
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitMeta {
    pub remaining: u32,
    pub reset_secs: u64,
}

/// Envelope metadata block
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub request_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformations_applied: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitMeta>,
}

/// Uniform success/error response envelope
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub metadata: ResponseMetadata,
}

/// Everything the HTTP layer needs to emit the response
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub status: u16,
    pub envelope: ResponseEnvelope,
    pub session_id: Uuid,
    /// Rotated token; always returned so counters persist
    pub session_token: String,
    pub cache_status: CacheStatus,
    pub rate_remaining: Option<u32>,
    pub retry_after_secs: Option<u64>,
}

/// The shared result of one upstream flight
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// Composes all core components into the per-request flow
pub struct RequestPipeline {
    config: Arc<ProxyConfig>,
    cache: Arc<TieredCache>,
    sessions: Arc<SessionEnvelope>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    flights: SingleFlight<FetchedDocument>,
    upstream: Arc<dyn UpstreamFetcher>,
    transformers: Arc<TransformerRegistry>,
    metrics: Arc<MetricsAggregator>,
}

struct RequestContext {
    started: Instant,
    request_id: String,
    correlation_id: String,
    session_id: Uuid,
    session_token: String,
    rate_remaining: Option<u32>,
    rate_window_secs: u64,
}

impl RequestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ProxyConfig>,
        cache: Arc<TieredCache>,
        sessions: Arc<SessionEnvelope>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        upstream: Arc<dyn UpstreamFetcher>,
        transformers: Arc<TransformerRegistry>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            config,
            cache,
            sessions,
            limiter,
            breaker,
            flights: SingleFlight::new(),
            upstream,
            transformers,
            metrics,
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Leaders launched by the single-flight coordinator
    pub fn flights_started(&self) -> u64 {
        self.flights.flights_started()
    }

    /// End-to-end request processing. Never fails: every error becomes an
    /// envelope with the matching HTTP status.
    pub async fn process(&self, request: ProxyRequest) -> PipelineResponse {
        let started = Instant::now();

        // Session refresh happens first so even error responses rotate the
        // token and keep counters alive.
        let fingerprint = format!("{}|{}", request.user_agent, request.client_ip);
        let (session, session_is_new) = self
            .sessions
            .refresh_or_create(request.session_token.as_deref(), &fingerprint);
        let session_token = match self.sessions.encrypt(&session) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "session encryption failed");
                String::new()
            }
        };

        let mut ctx = RequestContext {
            started,
            request_id: request.request_id.clone(),
            correlation_id: request.correlation_id.clone(),
            session_id: session.id,
            session_token,
            rate_remaining: None,
            rate_window_secs: self.config.rate_limit.default_window_secs,
        };

        if request.endpoint.is_empty() {
            return self.error_response(
                &ctx,
                "unknown",
                ProxyError::BadRequest("missing endpoint".to_string()),
                CacheStatus::Miss,
            );
        }
        let endpoint = request.endpoint.clone();

        let cache_override = request.cache_override
            || request
                .params
                .get("_cache_override")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false);

        let cache_key = derive_cache_key(&endpoint, &request.params);

        // Rate limit on the session identity; clients without a prior
        // session fall back to their IP.
        let identity = if session_is_new {
            request.client_ip.clone()
        } else {
            session.id.to_string()
        };
        let decision = self.limiter.allow(&identity, &endpoint);
        ctx.rate_remaining = Some(decision.remaining);
        ctx.rate_window_secs = self.config.rate_limit_for(&endpoint).1.as_secs();
        if !decision.allowed {
            self.metrics.record_denial(&endpoint);
            let retry_after_secs = decision.retry_after_secs.unwrap_or(1);
            return self.error_response(
                &ctx,
                &endpoint,
                ProxyError::RateLimited { retry_after_secs },
                CacheStatus::Miss,
            );
        }

        // Cache read path, unless overridden
        if !cache_override {
            if let Some(hit) = self.cache.get(&cache_key).await {
                return self.hit_response(&ctx, &endpoint, &request.transformations, hit);
            }
        }

        // The breaker guards the upstream; a refused request may still be
        // answered from an expired cache entry.
        if !self.breaker.admit(&endpoint) {
            debug!(endpoint, "circuit open, trying stale serve");
            if let Some(stale) = self.cache.get_stale(&cache_key).await {
                return self.stale_response(&ctx, &endpoint, stale);
            }
            return self.error_response(
                &ctx,
                &endpoint,
                ProxyError::CircuitOpen(endpoint.clone()),
                CacheStatus::Miss,
            );
        }

        let outcome = self
            .flights
            .run(&cache_key, self.make_flight(&endpoint, &cache_key, &request))
            .await;

        match outcome {
            Ok(document) => {
                let latency = ctx.started.elapsed();
                self.metrics.record_request(
                    &endpoint,
                    latency,
                    RequestOutcome::Fetched,
                    document.body.len(),
                );
                let (data, applied) =
                    self.render_body(&endpoint, &request.transformations, &document.body);
                self.success_response(&ctx, data, applied, CacheStatus::Miss, None, None)
            }
            Err(shared) => {
                if shared.allows_stale_serve() {
                    if let Some(stale) = self.cache.get_stale(&cache_key).await {
                        return self.stale_response(&ctx, &endpoint, stale);
                    }
                }
                let error = match Arc::try_unwrap(shared) {
                    Ok(error) => error,
                    Err(shared) => clone_error(&shared),
                };
                self.error_response(&ctx, &endpoint, error, CacheStatus::Miss)
            }
        }
    }

    /// Build the compute future for a single-flight leader: fetch, record
    /// breaker outcome, transform, pick a TTL, and write back through every
    /// tier. Runs detached so waiter cancellation cannot abort it.
    fn make_flight(
        &self,
        endpoint: &str,
        cache_key: &str,
        request: &ProxyRequest,
    ) -> impl std::future::Future<Output = Result<FetchedDocument, ProxyError>> + Send + 'static
    {
        let upstream = Arc::clone(&self.upstream);
        let transformers = Arc::clone(&self.transformers);
        let cache = Arc::clone(&self.cache);
        let breaker = Arc::clone(&self.breaker);
        let metrics = Arc::clone(&self.metrics);
        let config = Arc::clone(&self.config);
        let endpoint = endpoint.to_string();
        let cache_key = cache_key.to_string();
        let params = request.params.clone();
        let headers = request.forward_headers.clone();

        async move {
            match upstream.fetch(&endpoint, &params, &headers).await {
                Ok(response) => {
                    breaker.record_success(&endpoint);
                    let transformer = transformers.get(&endpoint);
                    let normalized = transformer.transform(&response.body)?;

                    let ttl = select_ttl(
                        &config,
                        &endpoint,
                        normalized.len(),
                        metrics.hits_per_hour(&endpoint),
                    );
                    cache
                        .put(&cache_key, &normalized, &response.content_type, Some(ttl))
                        .await;
                    info!(
                        endpoint,
                        bytes = normalized.len(),
                        ttl_secs = ttl.as_secs(),
                        "upstream result cached"
                    );

                    Ok(FetchedDocument {
                        body: normalized,
                        content_type: response.content_type,
                    })
                }
                Err(error) => {
                    if upstream_failure_counts(&error) {
                        breaker.record_failure(&endpoint);
                    }
                    Err(error)
                }
            }
        }
    }

    /// Parse the body for the envelope and apply any per-request
    /// transformation overrides. Returns the data value and the names of
    /// transformations applied.
    fn render_body(
        &self,
        endpoint: &str,
        overrides: &[String],
        body: &[u8],
    ) -> (Value, Option<Vec<String>>) {
        let mut applied = vec![self.transformers.get(endpoint).name().to_string()];
        let mut current = body.to_vec();

        for name in overrides {
            match self.transformers.lookup_override(name) {
                Some(transformer) => match transformer.transform(&current) {
                    Ok(next) => {
                        current = next;
                        applied.push(name.clone());
                    }
                    Err(e) => {
                        warn!(name, error = %e, "transformation override failed");
                    }
                },
                None => {
                    debug!(name, "unknown transformation override ignored");
                }
            }
        }

        let data = serde_json::from_slice(&current)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&current).into_owned()));
        (data, Some(applied))
    }

    fn hit_response(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        overrides: &[String],
        hit: CacheHit,
    ) -> PipelineResponse {
        self.metrics.record_request(
            endpoint,
            ctx.started.elapsed(),
            RequestOutcome::CacheHit(hit.tier_level),
            hit.body.len(),
        );
        let (data, applied) = self.render_body(endpoint, overrides, &hit.body);
        self.success_response(
            ctx,
            data,
            applied,
            CacheStatus::Hit,
            Some(("hit", hit.age, hit.tier_level)),
            None,
        )
    }

    fn stale_response(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        stale: CacheHit,
    ) -> PipelineResponse {
        warn!(endpoint, age_secs = stale.age.as_secs(), "serving stale cache entry");
        self.metrics.record_request(
            endpoint,
            ctx.started.elapsed(),
            RequestOutcome::StaleServe,
            stale.body.len(),
        );
        let data = serde_json::from_slice(&stale.body).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&stale.body).into_owned())
        });
        self.success_response(
            ctx,
            data,
            None,
            CacheStatus::Stale,
            Some(("stale", stale.age, stale.tier_level)),
            None,
        )
    }

    fn success_response(
        &self,
        ctx: &RequestContext,
        data: Value,
        transformations_applied: Option<Vec<String>>,
        cache_status: CacheStatus,
        cache_info: Option<(&'static str, Duration, usize)>,
        retry_after_secs: Option<u64>,
    ) -> PipelineResponse {
        let (cached, cache_age_secs, cache_tier) = match cache_info {
            Some((kind, age, tier)) => (
                Some(kind),
                Some(age.as_secs()),
                Some(format!("L{tier}")),
            ),
            None => (None, None, None),
        };

        PipelineResponse {
            status: 200,
            envelope: ResponseEnvelope {
                success: true,
                data: Some(data),
                error: None,
                metadata: self.metadata(
                    ctx,
                    cached,
                    cache_age_secs,
                    cache_tier,
                    transformations_applied,
                ),
            },
            session_id: ctx.session_id,
            session_token: ctx.session_token.clone(),
            cache_status,
            rate_remaining: ctx.rate_remaining,
            retry_after_secs,
        }
    }

    fn error_response(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        error: ProxyError,
        cache_status: CacheStatus,
    ) -> PipelineResponse {
        let status = error.status_code();
        // Denials are tallied separately; everything else is an error sample
        if !matches!(error, ProxyError::RateLimited { .. }) {
            self.metrics.record_request(
                endpoint,
                ctx.started.elapsed(),
                RequestOutcome::Error(status),
                0,
            );
        }

        let retry_after_secs = match &error {
            ProxyError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let dev_mode = self.config.server.dev_mode;

        PipelineResponse {
            status,
            envelope: ResponseEnvelope {
                success: false,
                data: None,
                error: Some(ErrorBody {
                    code: error.error_code().to_string(),
                    message: error.sanitized_message(dev_mode),
                    details: dev_mode.then(|| error.to_string()),
                }),
                metadata: self.metadata(ctx, None, None, None, None),
            },
            session_id: ctx.session_id,
            session_token: ctx.session_token.clone(),
            cache_status,
            rate_remaining: ctx.rate_remaining,
            retry_after_secs,
        }
    }

    fn metadata(
        &self,
        ctx: &RequestContext,
        cached: Option<&'static str>,
        cache_age_secs: Option<u64>,
        cache_tier: Option<String>,
        transformations_applied: Option<Vec<String>>,
    ) -> ResponseMetadata {
        ResponseMetadata {
            request_id: ctx.request_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            timestamp: Utc::now(),
            processing_time_ms: ctx.started.elapsed().as_millis() as u64,
            cached,
            cache_age_secs,
            cache_tier,
            transformations_applied,
            rate_limit: ctx.rate_remaining.map(|remaining| RateLimitMeta {
                remaining,
                reset_secs: ctx.rate_window_secs,
            }),
        }
    }
}

/// Whether an upstream error counts against the circuit breaker.
/// 4xx rejections reflect the request, not upstream health.
fn upstream_failure_counts(error: &ProxyError) -> bool {
    matches!(
        error,
        ProxyError::Upstream5xx { .. }
            | ProxyError::UpstreamTimeout(_)
            | ProxyError::UpstreamNetwork(_)
            | ProxyError::UpstreamUnavailable(_)
    )
}

fn clone_error(error: &ProxyError) -> ProxyError {
    match error {
        ProxyError::RateLimited { retry_after_secs } => ProxyError::RateLimited {
            retry_after_secs: *retry_after_secs,
        },
        ProxyError::Upstream4xx { status, body } => ProxyError::Upstream4xx {
            status: *status,
            body: body.clone(),
        },
        ProxyError::Upstream5xx { status, message } => ProxyError::Upstream5xx {
            status: *status,
            message: message.clone(),
        },
        ProxyError::BadRequest(m) => ProxyError::BadRequest(m.clone()),
        ProxyError::Unauthorized(m) => ProxyError::Unauthorized(m.clone()),
        ProxyError::InvalidSession(m) => ProxyError::InvalidSession(m.clone()),
        ProxyError::UpstreamTimeout(m) => ProxyError::UpstreamTimeout(m.clone()),
        ProxyError::UpstreamNetwork(m) => ProxyError::UpstreamNetwork(m.clone()),
        ProxyError::UpstreamUnavailable(m) => ProxyError::UpstreamUnavailable(m.clone()),
        ProxyError::CircuitOpen(m) => ProxyError::CircuitOpen(m.clone()),
        ProxyError::ServiceUnavailable(m) => ProxyError::ServiceUnavailable(m.clone()),
        ProxyError::Crypto(m) => ProxyError::Crypto(m.clone()),
        ProxyError::Transform(m) => ProxyError::Transform(m.clone()),
        ProxyError::Config(m) => ProxyError::Config(m.clone()),
        ProxyError::Internal(m) => ProxyError::Internal(m.clone()),
        other => ProxyError::Internal(other.to_string()),
    }
}

/// Pick the write-back TTL for an endpoint:
/// `clamp(base × freq_factor × size_factor, min, max)` with the base chosen
/// by endpoint category.
pub fn select_ttl(
    config: &ProxyConfig,
    endpoint: &str,
    size_bytes: usize,
    hits_per_hour: f64,
) -> Duration {
    let settings = &config.ttl;
    let head = endpoint.split('/').next().unwrap_or(endpoint);

    let base_secs = if head.contains("scoring") || head.contains("live") || head.contains("odds") {
        settings.realtime_secs
    } else if head.contains("field") || head.contains("rankings") {
        settings.dynamic_secs
    } else {
        settings.reference_secs
    };

    let freq_factor = (1.0 + hits_per_hour / 100.0).min(2.0);
    let size_factor = (1.0 + size_bytes as f64 / 1_000_000.0).min(1.5);
    let scaled = base_secs as f64 * freq_factor * size_factor;

    let clamped = scaled.clamp(settings.min_secs as f64, settings.max_secs as f64);
    Duration::from_secs_f64(clamped)
}
