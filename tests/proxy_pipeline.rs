//! End-to-end pipeline tests against a scripted upstream

use async_trait::async_trait;
use fairway_proxy::config::ProxyConfig;
use fairway_proxy::error::{ProxyError, Result};
use fairway_proxy::pipeline::{CacheStatus, ProxyRequest};
use fairway_proxy::server::ProxyServer;
use fairway_proxy::upstream::{UpstreamFetcher, UpstreamResponse};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted upstream reply
#[derive(Debug, Clone)]
enum Scripted {
    Ok(&'static str),
    Status(u16),
    NetworkError,
}

/// Upstream double: replays a script, then falls back to a default reply,
/// counting every call.
struct MockFetcher {
    calls: AtomicU64,
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    delay: Duration,
}

impl MockFetcher {
    fn ok(body: &'static str) -> Self {
        Self {
            calls: AtomicU64::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback: Scripted::Ok(body),
            delay: Duration::ZERO,
        }
    }

    fn scripted(script: Vec<Scripted>, fallback: Scripted) -> Self {
        Self {
            calls: AtomicU64::new(0),
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamFetcher for MockFetcher {
    async fn fetch(
        &self,
        _endpoint: &str,
        _params: &HashMap<String, String>,
        _headers: &HashMap<String, String>,
    ) -> Result<UpstreamResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Scripted::Ok(body) => Ok(UpstreamResponse {
                status: 200,
                body: body.as_bytes().to_vec(),
                content_type: "application/json".to_string(),
                size: body.len(),
            }),
            Scripted::Status(status) if (400..500).contains(&status) => {
                Err(ProxyError::Upstream4xx {
                    status,
                    body: String::new(),
                })
            }
            Scripted::Status(status) => Err(ProxyError::Upstream5xx {
                status,
                message: format!("scripted {status}"),
            }),
            Scripted::NetworkError => {
                Err(ProxyError::UpstreamNetwork("scripted refusal".to_string()))
            }
        }
    }
}

fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.server.dev_mode = true;
    config.session.master_key = "integration-test-master-key".to_string();
    config
}

fn build(config: ProxyConfig, fetcher: Arc<MockFetcher>) -> ProxyServer {
    ProxyServer::builder()
        .config(config)
        .upstream(fetcher)
        .build()
        .unwrap()
}

fn request(endpoint: &str, params: &[(&str, &str)]) -> ProxyRequest {
    ProxyRequest {
        endpoint: endpoint.to_string(),
        params: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        client_ip: "198.51.100.7".to_string(),
        user_agent: "integration-test".to_string(),
        request_id: "req-1".to_string(),
        correlation_id: "corr-1".to_string(),
        ..Default::default()
    }
}

const TOURNAMENTS_BODY: &str =
    r#"{"tournaments":[{"event_name":"The Open","start_date":"2024-07-18"}]}"#;

#[tokio::test]
async fn cold_get_then_l1_hit() {
    let fetcher = Arc::new(MockFetcher::ok(TOURNAMENTS_BODY));
    let server = build(test_config(), Arc::clone(&fetcher));
    let pipeline = server.pipeline();

    let first = pipeline
        .process(request("tournaments", &[("season", "2024")]))
        .await;
    assert_eq!(first.status, 200);
    assert_eq!(first.cache_status, CacheStatus::Miss);
    assert_eq!(fetcher.calls(), 1);

    // Body came back normalized to the stable schema
    let data = first.envelope.data.as_ref().unwrap();
    assert_eq!(data["metadata"]["count"], 1);
    assert_eq!(data["items"][0]["eventName"], "The Open");

    // All three tiers were populated
    let stats = pipeline.cache().stats().await;
    for (name, tier_stats) in &stats {
        assert_eq!(tier_stats.size, 1, "tier {name} not populated");
    }

    let second = pipeline
        .process(request("tournaments", &[("season", "2024")]))
        .await;
    assert_eq!(second.cache_status, CacheStatus::Hit);
    assert_eq!(second.envelope.metadata.cache_tier.as_deref(), Some("L1"));
    assert_eq!(second.envelope.metadata.cached, Some("hit"));
    assert_eq!(second.envelope.data, first.envelope.data);
    // No second upstream call
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn param_order_does_not_refetch() {
    let fetcher = Arc::new(MockFetcher::ok(TOURNAMENTS_BODY));
    let server = build(test_config(), Arc::clone(&fetcher));
    let pipeline = server.pipeline();

    pipeline
        .process(request("tournaments", &[("season", "2024"), ("tour", "pga")]))
        .await;
    let second = pipeline
        .process(request("tournaments", &[("tour", "pga"), ("season", "2024")]))
        .await;

    assert_eq!(second.cache_status, CacheStatus::Hit);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn hundred_concurrent_misses_one_fetch() {
    let fetcher = Arc::new(
        MockFetcher::ok(r#"{"scores":[{"player_id":1}]}"#)
            .with_delay(Duration::from_millis(50)),
    );
    let server = Arc::new(build(test_config(), Arc::clone(&fetcher)));

    let mut handles = Vec::new();
    for i in 0..100 {
        let server = Arc::clone(&server);
        handles.push(tokio::spawn(async move {
            let mut req = request("scoring/live/501", &[]);
            req.request_id = format!("req-{i}");
            server.pipeline().process(req).await
        }));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, 200);
        bodies.push(outcome.envelope.data.unwrap());
    }

    // Identical bodies, exactly one upstream call, one flight
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(server.pipeline().flights_started(), 1);
}

#[tokio::test]
async fn breaker_opens_after_consecutive_failures() {
    let mut config = test_config();
    config.breaker.failure_threshold = 5;
    config.breaker.open_timeout_secs = 1;
    let fetcher = Arc::new(MockFetcher::scripted(
        vec![Scripted::Status(500); 5],
        Scripted::Ok(r#"{"rankings":[{"player_name":"A"}]}"#),
    ));
    let server = build(config, Arc::clone(&fetcher));
    let pipeline = server.pipeline();

    for _ in 0..5 {
        let outcome = pipeline.process(request("rankings", &[])).await;
        assert_eq!(outcome.status, 502);
    }
    assert_eq!(fetcher.calls(), 5);

    // Circuit is open: no upstream dispatch, no cached body to fall back on
    let rejected = pipeline.process(request("rankings", &[])).await;
    assert_eq!(rejected.status, 503);
    assert_eq!(
        rejected.envelope.error.as_ref().unwrap().code,
        "CIRCUIT_OPEN"
    );
    assert_eq!(fetcher.calls(), 5);

    // After the open timeout a trial request probes the upstream
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let probe = pipeline.process(request("rankings", &[])).await;
    assert_eq!(probe.status, 200);
    assert_eq!(fetcher.calls(), 6);

    // Healthy again (served from cache or upstream, but not rejected)
    let after = pipeline.process(request("rankings", &[])).await;
    assert_eq!(after.status, 200);
}

#[tokio::test]
async fn stale_serve_when_upstream_down() {
    let mut config = test_config();
    // Immediate expiry for live scoring so the cached body goes stale fast
    config.ttl.realtime_secs = 1;
    config.ttl.min_secs = 1;
    config.breaker.failure_threshold = 1;
    let fetcher = Arc::new(MockFetcher::scripted(
        vec![
            Scripted::Ok(r#"{"scores":[{"hole":9}]}"#),
            Scripted::NetworkError,
        ],
        Scripted::NetworkError,
    ));
    let server = build(config, Arc::clone(&fetcher));
    let pipeline = server.pipeline();

    let fresh = pipeline.process(request("scoring", &[])).await;
    assert_eq!(fresh.status, 200);
    assert_eq!(fresh.cache_status, CacheStatus::Miss);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    // Entry expired, upstream down: the expired body is preferred over 502
    let stale = pipeline.process(request("scoring", &[])).await;
    assert_eq!(stale.status, 200);
    assert_eq!(stale.cache_status, CacheStatus::Stale);
    assert_eq!(stale.envelope.metadata.cached, Some("stale"));
    assert!(stale.envelope.metadata.cache_age_secs.unwrap() >= 1);

    // Circuit opened on that failure; stale body still answers
    let after_open = pipeline.process(request("scoring", &[])).await;
    assert_eq!(after_open.status, 200);
    assert_eq!(after_open.cache_status, CacheStatus::Stale);
    // Breaker open means no further upstream dispatch
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn tampered_session_token_starts_over() {
    let fetcher = Arc::new(MockFetcher::ok(TOURNAMENTS_BODY));
    let server = build(test_config(), Arc::clone(&fetcher));
    let pipeline = server.pipeline();

    let first = pipeline.process(request("tournaments", &[])).await;
    let token = first.session_token.clone();
    assert!(!token.is_empty());

    // Returning client keeps its identity
    let mut returning = request("tournaments", &[]);
    returning.session_token = Some(token.clone());
    let second = pipeline.process(returning).await;
    assert_eq!(second.session_id, first.session_id);

    // One flipped byte invalidates the envelope entirely
    let mut tampered_bytes = token.into_bytes();
    tampered_bytes[10] = if tampered_bytes[10] == b'A' { b'B' } else { b'A' };
    let mut tampered = request("tournaments", &[]);
    tampered.session_token = Some(String::from_utf8(tampered_bytes).unwrap());

    let third = pipeline.process(tampered).await;
    assert_ne!(third.session_id, first.session_id);
    // The replacement session starts its counters from one; decrypting the
    // new token elsewhere would show request_count == 1
    assert!(!third.session_token.is_empty());
}

#[tokio::test]
async fn rate_limit_denies_with_retry_after() {
    let mut config = test_config();
    config.rate_limit.default_limit = 100;
    config.rate_limit.default_window_secs = 60;
    let fetcher = Arc::new(MockFetcher::ok(TOURNAMENTS_BODY));
    let server = build(config, Arc::clone(&fetcher));
    let pipeline = server.pipeline();

    // Mint a session, then keep it across all limited requests so they
    // share one window (the minting request counts against the IP)
    let first = pipeline.process(request("tournaments", &[])).await;
    let mut token = first.session_token.clone();

    for _ in 0..100 {
        let mut req = request("tournaments", &[]);
        req.session_token = Some(token.clone());
        let outcome = pipeline.process(req).await;
        assert_eq!(outcome.status, 200);
        token = outcome.session_token.clone();
    }

    let mut req = request("tournaments", &[]);
    req.session_token = Some(token);
    let denied = pipeline.process(req).await;
    assert_eq!(denied.status, 429);
    assert_eq!(denied.envelope.error.as_ref().unwrap().code, "RATE_LIMITED");
    let retry_after = denied.retry_after_secs.unwrap();
    assert!(retry_after <= 60, "Retry-After {retry_after} exceeds window");
}

#[tokio::test]
async fn deep_hit_promotes_with_destination_ttl() {
    let mut config = test_config();
    // L1/L2 expire almost immediately; L3 holds for a day
    config.cache.l1.default_ttl_secs = 1;
    config.cache.l2.default_ttl_secs = 1;
    config.cache.l3.default_ttl_secs = 86400;
    config.ttl.reference_secs = 86400;
    let fetcher = Arc::new(MockFetcher::ok(TOURNAMENTS_BODY));
    let server = build(config, Arc::clone(&fetcher));
    let pipeline = server.pipeline();

    // Populate; write-back uses the computed TTL in every tier, so expire
    // the upper copies by waiting out their per-tier promotion TTL below.
    let first = pipeline.process(request("tournaments", &[])).await;
    assert_eq!(first.cache_status, CacheStatus::Miss);

    // Invalidate and refetch with explicit per-tier defaults: force the
    // upper tiers to expire while L3 stays live.
    pipeline.cache().invalidate(".*").await.unwrap();
    pipeline
        .cache()
        .put("tournaments:manual", b"{}", "application/json", None)
        .await;
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // L1/L2 copies are expired; the hit must come from L3
    let hit = pipeline.cache().get("tournaments:manual").await.unwrap();
    assert_eq!(hit.tier_level, 3);

    // Promotion used L1's own TTL, so the very next read answers from L1
    let hit = pipeline.cache().get("tournaments:manual").await.unwrap();
    assert_eq!(hit.tier_level, 1);
}

#[tokio::test]
async fn upstream_4xx_not_retried_not_cached() {
    let fetcher = Arc::new(MockFetcher::scripted(
        vec![Scripted::Status(404)],
        Scripted::Ok(TOURNAMENTS_BODY),
    ));
    let server = build(test_config(), Arc::clone(&fetcher));
    let pipeline = server.pipeline();

    let missing = pipeline.process(request("tournaments", &[])).await;
    assert_eq!(missing.status, 404);
    assert_eq!(fetcher.calls(), 1);

    // Nothing was cached; the next request goes upstream again
    let ok = pipeline.process(request("tournaments", &[])).await;
    assert_eq!(ok.status, 200);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn cache_override_skips_read_but_stores() {
    let fetcher = Arc::new(MockFetcher::ok(TOURNAMENTS_BODY));
    let server = build(test_config(), Arc::clone(&fetcher));
    let pipeline = server.pipeline();

    pipeline.process(request("tournaments", &[])).await;
    assert_eq!(fetcher.calls(), 1);

    // Override bypasses the read path and refetches
    let mut req = request("tournaments", &[]);
    req.cache_override = true;
    let refreshed = pipeline.process(req).await;
    assert_eq!(refreshed.cache_status, CacheStatus::Miss);
    assert_eq!(fetcher.calls(), 2);

    // But the result was stored: a plain request hits
    let hit = pipeline.process(request("tournaments", &[])).await;
    assert_eq!(hit.cache_status, CacheStatus::Hit);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn session_token_rotates_every_response() {
    let fetcher = Arc::new(MockFetcher::ok(TOURNAMENTS_BODY));
    let server = build(test_config(), Arc::clone(&fetcher));
    let pipeline = server.pipeline();

    let first = pipeline.process(request("tournaments", &[])).await;
    let mut req = request("tournaments", &[]);
    req.session_token = Some(first.session_token.clone());
    let second = pipeline.process(req).await;

    assert_eq!(second.session_id, first.session_id);
    assert_ne!(second.session_token, first.session_token);
}

#[tokio::test]
async fn invalidate_pattern_forces_refetch() {
    let fetcher = Arc::new(MockFetcher::ok(TOURNAMENTS_BODY));
    let server = build(test_config(), Arc::clone(&fetcher));
    let pipeline = server.pipeline();

    pipeline.process(request("tournaments", &[])).await;
    assert_eq!(
        pipeline.cache().invalidate("^tournaments:").await.unwrap(),
        1
    );

    let after = pipeline.process(request("tournaments", &[])).await;
    assert_eq!(after.cache_status, CacheStatus::Miss);
    assert_eq!(fetcher.calls(), 2);
}
