//! Upstream data feed client
//!
//! Fetches vendor payloads over HTTPS with bounded retries, exponential
//! backoff with uniform jitter, and a per-attempt timeout. The vendor API
//! key lives only in configuration and is appended at request-build time;
//! it never reaches logs, cache keys, or error bodies.

use crate::config::UpstreamSettings;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// A fetched upstream payload
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: String,
    pub size: usize,
}

/// Seam between the pipeline and the wire. Tests substitute a scripted
/// implementation; production uses [`DataFeedClient`].
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    async fn fetch(
        &self,
        endpoint: &str,
        params: &HashMap<String, String>,
        headers: &HashMap<String, String>,
    ) -> Result<UpstreamResponse>;
}

/// reqwest-backed fetcher for the golf data feed
pub struct DataFeedClient {
    http: reqwest::Client,
    settings: UpstreamSettings,
}

impl DataFeedClient {
    pub fn new(settings: UpstreamSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.attempt_timeout())
            .build()
            .map_err(|e| ProxyError::Config(format!("http client build failed: {e}")))?;
        Ok(Self { http, settings })
    }

    fn build_url(&self, endpoint: &str, params: &HashMap<String, String>) -> String {
        let base = self.settings.base_url.trim_end_matches('/');
        let mut url = format!("{base}/{endpoint}");

        let mut pairs: Vec<(&str, &str)> = params
            .iter()
            // Control params stay internal; any client-supplied credential
            // is dropped in favor of the configured one
            .filter(|(name, _)| !name.starts_with('_') && !name.eq_ignore_ascii_case("key"))
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        pairs.sort();

        let mut separator = '?';
        for (name, value) in pairs {
            url.push(separator);
            url.push_str(&urlencode(name));
            url.push('=');
            url.push_str(&urlencode(value));
            separator = '&';
        }
        url.push(separator);
        url.push_str("key=");
        url.push_str(&urlencode(&self.settings.api_key));
        url
    }

    async fn attempt(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<UpstreamResponse> {
        let mut request = self.http.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::UpstreamTimeout(format!(
                    "attempt exceeded {}s",
                    self.settings.attempt_timeout_secs
                ))
            } else {
                ProxyError::UpstreamNetwork(e.without_url().to_string())
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::UpstreamNetwork(e.without_url().to_string()))?
            .to_vec();

        classify(status, body, content_type)
    }
}

/// Map an upstream status to a response or the matching error kind
pub(crate) fn classify(
    status: u16,
    body: Vec<u8>,
    content_type: String,
) -> Result<UpstreamResponse> {
    match status {
        200..=299 => {
            let size = body.len();
            Ok(UpstreamResponse {
                status,
                body,
                content_type,
                size,
            })
        }
        429 => Err(ProxyError::Upstream4xx {
            status,
            body: String::new(),
        }),
        400..=499 => Err(ProxyError::Upstream4xx {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        }),
        _ => Err(ProxyError::Upstream5xx {
            status,
            message: format!("upstream returned {status}"),
        }),
    }
}

/// `base × 2^k` plus uniform jitter in `[0, base)`
pub(crate) fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exponential = base.saturating_mul(1u32 << attempt.min(16));
    let jitter_ms = rand::thread_rng().gen_range(0..base.as_millis().max(1) as u64);
    exponential + Duration::from_millis(jitter_ms)
}

#[async_trait]
impl UpstreamFetcher for DataFeedClient {
    async fn fetch(
        &self,
        endpoint: &str,
        params: &HashMap<String, String>,
        headers: &HashMap<String, String>,
    ) -> Result<UpstreamResponse> {
        if self.settings.api_key.is_empty() {
            return Err(ProxyError::Config("upstream API key not configured".into()));
        }

        let url = self.build_url(endpoint, params);
        let mut last_error = None;

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1, self.settings.base_delay());
                debug!(endpoint, attempt, delay_ms = delay.as_millis() as u64, "retrying upstream");
                tokio::time::sleep(delay).await;
            }

            match self.attempt(&url, headers).await {
                Ok(response) => {
                    debug!(
                        endpoint,
                        status = response.status,
                        bytes = response.size,
                        "upstream fetch succeeded"
                    );
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    warn!(endpoint, attempt, error = %e, "retryable upstream failure");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(ProxyError::UpstreamUnavailable(format!(
            "retries exhausted for {endpoint}: {detail}"
        )))
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push_str("%20"),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
