//! # fairway-proxy
//!
//! Caching, rate-limiting, fault-tolerant reverse proxy for third-party
//! golf data feeds.
//!
//! Requests name a downstream endpoint and parameters; responses come from a
//! three-tier in-memory cache (LRU/FIFO/LFU with promotion on read) or a
//! fresh upstream fetch with retry and backoff, normalized to a stable
//! schema and written back through every tier. A sliding-window rate limiter
//! and a per-endpoint circuit breaker guard the upstream; concurrent
//! identical misses coalesce into a single fetch; anonymous client sessions
//! travel inside an AES-256-GCM envelope the server never stores.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod single_flight;
pub mod transform;
pub mod upstream;

pub use breaker::CircuitBreaker;
pub use cache::{derive_cache_key, TieredCache};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use metrics::MetricsAggregator;
pub use pipeline::{PipelineResponse, ProxyRequest, RequestPipeline};
pub use rate_limit::RateLimiter;
pub use server::{ProxyServer, ProxyServerBuilder};
pub use session::{SessionEnvelope, SessionRecord};
pub use single_flight::SingleFlight;
pub use transform::TransformerRegistry;
pub use upstream::{DataFeedClient, UpstreamFetcher, UpstreamResponse};
