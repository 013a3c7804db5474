use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::broadcast::Broadcaster;
use crate::cache::CacheStatus;
use crate::coalesce::{Coalescer, LocalStats};
use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::origin::ProxyRequest;
use crate::proxy::{Proxy, Served};

pub struct AppState {
    pub proxy: Arc<Proxy>,
    pub metrics: Arc<MetricsAggregator>,
    pub broadcaster: Arc<Broadcaster>,
    pub coalescer: Arc<Coalescer>,
    pub config: Arc<Config>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct CoalesceStatusResponse {
    pub enabled: bool,
    pub local_waiters: bool,
    pub lease_secs: u64,
    pub follower_budget_ms: u64,
    pub local: LocalStats,
}

// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// Metrics snapshot, same payload as the realtime feed
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot().await)
}

// Metrics endpoint (Prometheus format)
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = state.metrics.gather();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics,
    )
}

// Local coalescing table
pub async fn coalesce_stats(State(state): State<Arc<AppState>>) -> Json<CoalesceStatusResponse> {
    let config = state.coalescer.config();
    Json(CoalesceStatusResponse {
        enabled: config.enabled,
        local_waiters: config.local_waiters,
        lease_secs: config.lease_secs,
        follower_budget_ms: config.follower_budget().as_millis() as u64,
        local: state.coalescer.local_stats(),
    })
}

// Realtime metrics feed
pub async fn stream(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let broadcaster = state.broadcaster.clone();
    ws.on_upgrade(move |socket| broadcaster.serve_socket(socket))
}

// Main proxy handler
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path())
        .to_string();

    let request = ProxyRequest {
        method,
        path_and_query,
        headers,
        body,
    };

    let served = state.proxy.serve(request).await?;
    build_response(served)
}

fn build_response(served: Served) -> ProxyResult<Response> {
    let Served {
        entry,
        cache_status,
    } = served;

    let status = StatusCode::from_u16(entry.status_code).map_err(|_| {
        ProxyError::BackendError(format!("invalid upstream status {}", entry.status_code))
    })?;

    let mut response = Response::new(Body::from(entry.body));
    *response.status_mut() = status;

    // Add headers from upstream/cache, repeats included
    let headers = response.headers_mut();
    for (key, value) in &entry.headers {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_bytes(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %key, "Dropping invalid upstream header"),
        }
    }

    headers.insert("x-cache", cache_status_header(cache_status));

    Ok(response)
}

fn cache_status_header(cache_status: CacheStatus) -> HeaderValue {
    HeaderValue::from_static(cache_status.as_str())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let config = state.config.clone();
    let server = &config.server;

    let admin_routes = Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .route("/coalesce", get(coalesce_stats))
        .route("/stream", get(stream));

    let prefix = server.route_prefix.trim_end_matches('/');
    let body_limit = match server.max_body_bytes {
        0 => DefaultBodyLimit::disable(),
        limit => DefaultBodyLimit::max(limit),
    };
    let proxy_routes = Router::new()
        .route(&format!("{}/{{*path}}", prefix), any(proxy_handler))
        .route(if prefix.is_empty() { "/" } else { prefix }, any(proxy_handler))
        .layer(body_limit);

    Router::new()
        .nest(&server.admin_prefix, admin_routes)
        .merge(proxy_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}
