//! HTTP handlers for the proxy and admin surfaces

use super::AppState;
use crate::pipeline::{PipelineResponse, ProxyRequest};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// JSON body accepted by `POST /proxy/{endpoint}`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyPostBody {
    pub parameters: HashMap<String, String>,
    pub transformations: Vec<String>,
    pub output_format: Option<String>,
    pub cache_override: bool,
}

/// Body accepted by `POST /admin/cache/invalidate`
#[derive(Debug, Deserialize)]
pub struct InvalidateBody {
    pub pattern: String,
}

#[derive(Debug, Serialize)]
pub struct InvalidateReport {
    pub pattern: String,
    pub deleted: usize,
}

/// `GET /proxy/{endpoint}?{params}`
pub async fn proxy_get(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let transformations = params
        .get("_transformations")
        .map(|csv| {
            csv.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let request = build_request(&headers, endpoint, params, transformations, false);
    let outcome = state.pipeline.process(request).await;
    emit(outcome, &state)
}

/// `POST /proxy/{endpoint}` with a JSON parameter body
pub async fn proxy_post(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ProxyPostBody>>,
) -> Response {
    let Json(body) = body.unwrap_or_default();
    if let Some(format) = &body.output_format {
        if format != "json" {
            debug!(format, "unsupported output format requested, serving json");
        }
    }

    let request = build_request(
        &headers,
        endpoint,
        body.parameters,
        body.transformations,
        body.cache_override,
    );
    let outcome = state.pipeline.process(request).await;
    emit(outcome, &state)
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

/// `GET /admin/stats`
pub async fn stats(State(state): State<AppState>) -> Response {
    let snapshot = state
        .pipeline
        .metrics()
        .snapshot(state.pipeline.breaker().transition_count());
    Json(snapshot).into_response()
}

/// `GET /admin/cache/stats`
pub async fn cache_stats(State(state): State<AppState>) -> Response {
    let stats: HashMap<String, _> = state
        .pipeline
        .cache()
        .stats()
        .await
        .into_iter()
        .collect();
    Json(stats).into_response()
}

/// `POST /admin/cache/invalidate`
pub async fn invalidate_cache(
    State(state): State<AppState>,
    Json(body): Json<InvalidateBody>,
) -> Response {
    match state.pipeline.cache().invalidate(&body.pattern).await {
        Ok(deleted) => Json(InvalidateReport {
            pattern: body.pattern,
            deleted,
        })
        .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.sanitized_message(state.config.server.dev_mode) })),
        )
            .into_response(),
    }
}

/// `GET /admin/breakers`
pub async fn breakers(State(state): State<AppState>) -> Response {
    Json(state.pipeline.breaker().snapshots()).into_response()
}

fn build_request(
    headers: &HeaderMap,
    endpoint: String,
    params: HashMap<String, String>,
    transformations: Vec<String>,
    cache_override: bool,
) -> ProxyRequest {
    let session_token = header_value(headers, "x-session-id")
        .or_else(|| cookie_value(headers, "golf_session"));

    let client_ip = header_value(headers, "x-forwarded-for")
        .and_then(|list| list.split(',').next().map(|ip| ip.trim().to_string()))
        .or_else(|| header_value(headers, "x-real-ip"))
        .unwrap_or_else(|| "unknown".to_string());

    let request_id =
        header_value(headers, "x-request-id").unwrap_or_else(|| Uuid::new_v4().to_string());
    let correlation_id =
        header_value(headers, "x-correlation-id").unwrap_or_else(|| Uuid::new_v4().to_string());

    ProxyRequest {
        endpoint: endpoint.trim_matches('/').to_string(),
        params,
        forward_headers: HashMap::new(),
        session_token,
        client_ip,
        user_agent: header_value(headers, header::USER_AGENT.as_str()).unwrap_or_default(),
        cache_override,
        transformations,
        request_id,
        correlation_id,
    }
}

fn emit(outcome: PipelineResponse, state: &AppState) -> Response {
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(&outcome.envelope)).into_response();
    let headers = response.headers_mut();

    set_header(headers, "x-request-id", &outcome.envelope.metadata.request_id);
    set_header(
        headers,
        "x-correlation-id",
        &outcome.envelope.metadata.correlation_id,
    );
    set_header(headers, "x-cache-status", outcome.cache_status.as_str());

    if !outcome.session_token.is_empty() {
        set_header(headers, "x-session-id", &outcome.session_token);
        let mut cookie = format!(
            "golf_session={}; HttpOnly; SameSite=Strict; Path=/",
            outcome.session_token
        );
        if !state.config.server.dev_mode {
            cookie.push_str("; Secure");
        }
        set_header(headers, header::SET_COOKIE.as_str(), &cookie);
    }

    if let Some(remaining) = outcome.rate_remaining {
        set_header(headers, "x-ratelimit-remaining", &remaining.to_string());
    }
    if let Some(retry_after) = outcome.retry_after_secs {
        set_header(headers, header::RETRY_AFTER.as_str(), &retry_after.to_string());
    }

    response
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        if let Ok(name) = name.parse::<header::HeaderName>() {
            headers.insert(name, value);
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(|v| v.to_string()).filter(|v| !v.is_empty());
        }
    }
    None
}
