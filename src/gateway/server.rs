//! # HTTP Server Module
//!
//! A thin reverse proxy in front of the [`Router`].
//!
//! - `GET /-/health` reports liveness (503 once shutdown has begun)
//! - `GET /-/services` lists every registered service with its endpoints and balancer state
//! - Anything else is proxied: the service key comes from the leading path segments
//!   (`/{name}/...` or `/{namespace}/{name}/...`), the request is forwarded to the selected
//!   endpoint with `reqwest`, and the endpoint is released when the exchange finishes
//!
//! ## Rust Concepts Used
//!
//! - Axum's `State` extractor to share the router and HTTP client across handlers
//! - `tokio::net::TcpListener` for accepting incoming connections
//! - `with_graceful_shutdown` tied to a `CancellationToken`

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router as AxumRouter,
};
use serde_json::json;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::core::config::GatewaySettings;
use crate::core::error::{GatewayError, GatewayResult};
use crate::routing::Router;

/// Largest request body forwarded upstream
const MAX_REQUEST_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub upstream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&GatewaySettings> for ServerConfig {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            bind_addr: settings.listen_addr,
            upstream_timeout: settings.upstream_timeout,
        }
    }
}

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    router: Router,
    client: reqwest::Client,
}

pub struct GatewayServer {
    app: AxumRouter,
    config: ServerConfig,
}

impl GatewayServer {
    pub fn new(router: Router, config: ServerConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()?;
        let state = ServerState { router, client };

        let app = AxumRouter::new()
            .route("/-/health", get(health_check))
            .route("/-/services", get(list_services))
            .fallback(proxy_request)
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        Ok(Self { app, config })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// The axum application, for embedding or in-process testing
    pub fn app(&self) -> AxumRouter {
        self.app.clone()
    }

    /// Bind the configured address and serve until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) -> GatewayResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| GatewayError::Io {
                message: format!("Failed to bind gateway server to {}: {}", self.config.bind_addr, e),
            })?;
        self.serve_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` is cancelled.
    ///
    /// New connections stop being accepted once the token fires; requests in flight
    /// complete.
    pub async fn serve_with_listener(self, listener: TcpListener, shutdown: CancellationToken) -> GatewayResult<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway HTTP server listening");

        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| GatewayError::Io {
                message: format!("Gateway server error: {}", e),
            })?;

        info!("Gateway HTTP server stopped");
        Ok(())
    }
}

async fn health_check(State(state): State<ServerState>) -> Response {
    let stats = state.router.registry().stats();
    if state.router.is_shutting_down() {
        let body = json!({ "status": "shutting_down", "services": stats.total_services });
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    }
    Json(json!({ "status": "ok", "services": stats.total_services })).into_response()
}

async fn list_services(State(state): State<ServerState>) -> Response {
    let registry = state.router.registry();
    Json(json!({
        "stats": registry.stats(),
        "services": registry.snapshots(),
    }))
    .into_response()
}

async fn proxy_request(State(state): State<ServerState>, request: Request) -> Response {
    match forward(&state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward(state: &ServerState, request: Request) -> GatewayResult<Response> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path();

    let (service, rest) = state.router.resolve_path(path).ok_or_else(|| {
        let requested = path.trim_start_matches('/').split('/').next().unwrap_or_default();
        GatewayError::not_found(requested)
    })?;

    // Held until the upstream exchange is over, then dropped to release capacity
    let lease = state.router.acquire(&service)?;
    let url = upstream_url(lease.endpoint(), &rest, parts.uri.query());

    let body: Bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::HttpClient {
            message: format!("Failed to read request body: {}", e),
        })?;

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()).map_err(|e| {
        GatewayError::HttpClient {
            message: format!("Unsupported method {}: {}", parts.method, e),
        }
    })?;

    let mut upstream = state.client.request(method, &url).body(body);
    for (name, value) in forwardable(&parts.headers) {
        upstream = upstream.header(name, value);
    }

    let started = Instant::now();
    debug!(service = %service, endpoint = %lease.endpoint(), url = %url, "Forwarding request");

    let response = upstream.send().await.map_err(|e| {
        warn!(service = %service, endpoint = %lease.endpoint(), error = %e, "Upstream request failed");
        GatewayError::HttpClient {
            message: format!("Upstream {} failed: {}", lease.endpoint(), e),
        }
    })?;

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }

    let payload = response.bytes().await.map_err(|e| GatewayError::HttpClient {
        message: format!("Failed to read upstream response from {}: {}", lease.endpoint(), e),
    })?;

    debug!(
        service = %service,
        endpoint = %lease.endpoint(),
        status = status.as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Upstream responded"
    );
    drop(lease);

    builder.body(Body::from(payload)).map_err(|e| GatewayError::HttpClient {
        message: format!("Failed to build response: {}", e),
    })
}

fn forwardable(headers: &HeaderMap) -> impl Iterator<Item = (&str, &[u8])> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.as_str(), value.as_bytes()))
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|header| header.eq_ignore_ascii_case(name))
}

/// Join an endpoint (`host:port` or a full base URL) with the remaining path and query
fn upstream_url(endpoint: &str, path: &str, query: Option<&str>) -> String {
    let base = if endpoint.contains("://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", endpoint.trim_end_matches('/'))
    };

    match query {
        Some(query) if !query.is_empty() => format!("{}{}?{}", base, path, query),
        _ => format!("{}{}", base, path),
    }
}
