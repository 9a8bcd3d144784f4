//! Error types for fairway-proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Main error type for the proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed URL or parameters
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Session envelope was required but could not be decrypted
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Session token failed to parse, authenticate, or deserialize
    #[error("Invalid session token: {0}")]
    InvalidSession(String),

    /// Rate limiter denied admission
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Upstream returned a 4xx status other than 429
    #[error("Upstream rejected request with status {status}")]
    Upstream4xx { status: u16, body: String },

    /// Upstream returned a 5xx status
    #[error("Upstream server error {status}: {message}")]
    Upstream5xx { status: u16, message: String },

    /// Upstream request attempt timed out
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Network-level failure talking to the upstream
    #[error("Upstream network error: {0}")]
    UpstreamNetwork(String),

    /// Retries exhausted against the upstream
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Circuit breaker refused admission
    #[error("Circuit open for endpoint {0}")]
    CircuitOpen(String),

    /// Service cannot satisfy the request and no stale fallback exists
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Cryptographic primitive failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Response transformation failed
    #[error("Transform error: {0}")]
    Transform(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wrapped serde_json error
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Wrapped IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// HTTP status code this error maps to
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::BadRequest(_) => 400,
            ProxyError::Unauthorized(_) | ProxyError::InvalidSession(_) => 401,
            ProxyError::RateLimited { .. } => 429,
            ProxyError::Upstream4xx { status, .. } => *status,
            ProxyError::Upstream5xx { .. }
            | ProxyError::UpstreamTimeout(_)
            | ProxyError::UpstreamNetwork(_)
            | ProxyError::UpstreamUnavailable(_) => 502,
            ProxyError::CircuitOpen(_) | ProxyError::ServiceUnavailable(_) => 503,
            ProxyError::Crypto(_)
            | ProxyError::Transform(_)
            | ProxyError::Config(_)
            | ProxyError::Internal(_)
            | ProxyError::Json(_)
            | ProxyError::Io(_) => 500,
        }
    }

    /// Stable machine-readable code for the response envelope
    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "BAD_REQUEST",
            ProxyError::Unauthorized(_) => "UNAUTHORIZED",
            ProxyError::InvalidSession(_) => "INVALID_SESSION",
            ProxyError::RateLimited { .. } => "RATE_LIMITED",
            ProxyError::Upstream4xx { .. } => "UPSTREAM_REJECTED",
            ProxyError::Upstream5xx { .. } => "UPSTREAM_ERROR",
            ProxyError::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            ProxyError::UpstreamNetwork(_) => "UPSTREAM_NETWORK",
            ProxyError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            ProxyError::CircuitOpen(_) => "CIRCUIT_OPEN",
            ProxyError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ProxyError::Crypto(_) => "CRYPTO_ERROR",
            ProxyError::Transform(_) => "TRANSFORM_ERROR",
            ProxyError::Config(_) => "CONFIG_ERROR",
            ProxyError::Internal(_) | ProxyError::Json(_) | ProxyError::Io(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the upstream retry loop should try again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::Upstream5xx { .. }
                | ProxyError::UpstreamTimeout(_)
                | ProxyError::UpstreamNetwork(_)
                | ProxyError::Upstream4xx { status: 429, .. }
        )
    }

    /// Whether the pipeline should attempt a stale cache serve for this error
    pub fn allows_stale_serve(&self) -> bool {
        matches!(
            self,
            ProxyError::CircuitOpen(_)
                | ProxyError::UpstreamUnavailable(_)
                | ProxyError::UpstreamTimeout(_)
                | ProxyError::UpstreamNetwork(_)
                | ProxyError::Upstream5xx { .. }
        )
    }

    /// Client-safe message with internal detail stripped
    pub fn sanitized_message(&self, dev_mode: bool) -> String {
        if dev_mode {
            return self.to_string();
        }
        match self {
            ProxyError::BadRequest(_) => "invalid request".to_string(),
            ProxyError::Unauthorized(_) | ProxyError::InvalidSession(_) => {
                "invalid session".to_string()
            }
            ProxyError::RateLimited { retry_after_secs } => {
                format!("rate limit exceeded, retry after {retry_after_secs}s")
            }
            ProxyError::Upstream4xx { status, .. } => {
                format!("upstream rejected request with status {status}")
            }
            ProxyError::Upstream5xx { .. }
            | ProxyError::UpstreamTimeout(_)
            | ProxyError::UpstreamNetwork(_)
            | ProxyError::UpstreamUnavailable(_) => "upstream data feed unavailable".to_string(),
            ProxyError::CircuitOpen(_) | ProxyError::ServiceUnavailable(_) => {
                "service temporarily unavailable".to_string()
            }
            _ => "internal server error".to_string(),
        }
    }
}
