//! HTTP middleware.

use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use tracing::{debug, info};
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Propagate or assign a request ID and echo it on the response.
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response<Body> {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Request logging middleware.
///
/// Worker traffic under `/internal` and chunk downloads are frequent, so
/// they log at debug level; probes are not logged at all.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let duration_ms = start.elapsed().as_millis();
    let path = uri.path();

    if matches!(path, "/health" | "/ready" | "/metrics") {
        return response;
    }
    if path.starts_with("/internal/") || path == "/v1/chunks" {
        debug!(method = %method, uri = %uri, status = %status, duration_ms, "Request completed");
    } else {
        info!(method = %method, uri = %uri, status = %status, duration_ms, "Request completed");
    }

    response
}
