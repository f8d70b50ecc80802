use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics;
use crate::services::AppState;

pub mod admin;
pub mod quiz;
pub mod streak;
pub mod study;

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut dependencies = serde_json::Map::new();

    let store = match tokio::time::timeout(Duration::from_secs(1), state.store.ping()).await {
        Ok(Ok(())) => json!({ "status": "healthy" }),
        Ok(Err(e)) => json!({ "status": "unhealthy", "error": e.to_string() }),
        Err(_) => json!({ "status": "unhealthy", "error": "store timeout after 1s" }),
    };
    let store_healthy = store["status"] == "healthy";
    dependencies.insert("store".to_string(), store);

    let cache_healthy = matches!(
        tokio::time::timeout(Duration::from_millis(500), state.cache.ping()).await,
        Ok(true)
    );
    dependencies.insert(
        "cache".to_string(),
        json!({ "status": if cache_healthy { "healthy" } else { "unhealthy" } }),
    );

    // The cache only degrades reads; the store is required.
    let (status_code, status) = match (store_healthy, cache_healthy) {
        (true, true) => (StatusCode::OK, "healthy"),
        (true, false) => (StatusCode::OK, "degraded"),
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "service": "engagement-api",
            "version": env!("CARGO_PKG_VERSION"),
            "dependencies": dependencies
        })),
    )
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}

/// Protects /metrics with HTTP Basic auth against `METRICS_AUTH` (`user:password`).
pub async fn metrics_auth_middleware(
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let decoded = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let credentials = String::from_utf8(decoded).map_err(|_| StatusCode::UNAUTHORIZED)?;

    let expected = std::env::var("METRICS_AUTH").unwrap_or_else(|_| "admin:changeme".to_string());
    if credentials != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}
