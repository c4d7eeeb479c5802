//! HTTP proxy logic
//!
//! Translates an inbound axum request into `anthropic_pool::interceptor`'s
//! transport-agnostic `OutboundRequest`, drives it through
//! `Interceptor::forward`, and translates the result back into an axum
//! response — streamed when the upstream body is SSE.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use tracing::warn;

use anthropic_pool::{Interceptor, OutboundRequest};

use crate::metrics::{record_request, record_upstream_error};

/// Headers to strip before forwarding (hop-by-hop)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
pub struct ProxyState {
    pub interceptor: Arc<Interceptor>,
    pub upstream_base: String,
    pub timeout: Duration,
}

/// Proxy a request to upstream through the account interceptor.
pub async fn proxy_request(state: &ProxyState, request: Request<Body>, request_id: String) -> Response<Body> {
    let (parts, body) = request.into_parts();

    let body_bytes = match axum::body::to_bytes(body, 64 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(request_id, error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let url = match build_upstream_url(&state.upstream_base, &parts.uri) {
        Ok(url) => url,
        Err(e) => {
            warn!(request_id, error = %e, "invalid upstream url");
            return (StatusCode::BAD_REQUEST, "invalid request target").into_response();
        }
    };

    let mut headers = parts.headers.clone();
    headers.retain(|name, _| !is_hop_by_hop(name.as_str()));

    let method_label = parts.method.to_string();
    let outbound = OutboundRequest {
        method: parts.method.clone(),
        url,
        headers,
        body: if body_bytes.is_empty() { None } else { Some(body_bytes) },
    };

    let started = Instant::now();
    let result = tokio::time::timeout(state.timeout, state.interceptor.forward(outbound)).await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(Ok(response)) => {
            record_request(response.status, &method_label, elapsed);
            let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = Response::builder().status(status);
            for (name, value) in response.headers.iter() {
                if !is_hop_by_hop(name.as_str()) {
                    builder = builder.header(name, value);
                }
            }
            let stream = response.body;
            builder
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Ok(Err(e)) => {
            record_request(502, &method_label, elapsed);
            record_upstream_error("pool_exhausted");
            warn!(request_id, error = %e, "request failed: account pool exhausted or upstream error");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
        Err(_) => {
            record_request(504, &method_label, elapsed);
            record_upstream_error("timeout");
            warn!(request_id, timeout_secs = state.timeout.as_secs(), "upstream request timed out");
            (StatusCode::GATEWAY_TIMEOUT, "upstream request timed out").into_response()
        }
    }
}

fn build_upstream_url(base: &str, uri: &axum::http::Uri) -> Result<reqwest::Url, String> {
    let mut url = reqwest::Url::parse(base).map_err(|e| e.to_string())?;
    url.set_path(uri.path());
    url.set_query(uri.query());
    Ok(url)
}

/// Check if header is hop-by-hop
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
    }

    #[test]
    fn build_upstream_url_preserves_path_and_query() {
        let uri: axum::http::Uri = "/v1/messages?beta=true".parse().unwrap();
        let url = build_upstream_url("https://api.anthropic.com", &uri).unwrap();
        assert_eq!(url.as_str(), "https://api.anthropic.com/v1/messages?beta=true");
    }
}
