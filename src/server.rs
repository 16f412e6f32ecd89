//! HTTP surfaces of the load balancer.
//!
//! The dispatcher answers every path on every host by forwarding to the
//! next worker registered for the request's host. The registration API
//! adds and removes workers at `/` and exposes `/status`, `/health` and
//! `/metrics`.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, trace, warn};

use crate::{
    balancer::WorkerRegistry,
    endpoint::{BalancerError, Worker},
    forwarder,
    metrics::{ACTIVE_DISPATCHES, DISPATCH_FAILED, DISPATCH_NOT_FOUND, DISPATCH_REQUESTS_TOTAL},
};

/// RAII guard for tracking in-flight dispatches.
struct DispatchGuard;

impl DispatchGuard {
    fn new() -> Self {
        ACTIVE_DISPATCHES.inc();
        Self
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        ACTIVE_DISPATCHES.dec();
    }
}

#[derive(Clone)]
pub struct DispatchState {
    pub registry: Arc<WorkerRegistry>,
    pub client: Client,
}

/// Request bodies are passed through whole, with no size limit.
pub fn dispatch_router(registry: Arc<WorkerRegistry>, client: Client) -> Router {
    Router::new()
        .fallback(handle_dispatch)
        .layer(DefaultBodyLimit::disable())
        .with_state(DispatchState { registry, client })
}

pub fn api_router(registry: Arc<WorkerRegistry>) -> Router {
    Router::new()
        .route("/", post(handle_register).delete(handle_deregister))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

/// The routing key of a request: its `Host` header verbatim, or the URI
/// authority for absolute-form requests.
pub fn routing_key(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.as_str().to_string()))
}

fn not_found(e: BalancerError) -> Response {
    DISPATCH_NOT_FOUND.inc();
    trace!(error = %e, "Request not routed");
    (StatusCode::NOT_FOUND, "Not found.\n").into_response()
}

/// Forwards the request to the current worker of its host, then advances
/// that host's cursor. Failures are answered with a 500 and never retried
/// on another worker.
async fn handle_dispatch(
    State(state): State<DispatchState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _guard = DispatchGuard::new();

    let Some(host) = routing_key(&headers, &uri) else {
        return not_found(BalancerError::NotFound("request carries no host".to_string()));
    };
    let Some(selection) = state.registry.select(&host) else {
        return not_found(BalancerError::NotFound(format!("no workers for host {}", host)));
    };

    DISPATCH_REQUESTS_TOTAL.with_label_values(&[&host]).inc();
    trace!(host = %host, worker = %selection.worker, index = selection.index, "Selected worker");

    let result =
        forwarder::forward_request(&state.client, &selection.worker, method, &uri, &headers, body)
            .await;
    state.registry.advance_after(&host, &selection);

    match result {
        Ok(upstream) => (upstream.status, upstream.headers, upstream.body).into_response(),
        Err(e) => {
            DISPATCH_FAILED.with_label_values(&[&host]).inc();
            error!(host = %host, worker = %selection.worker, error = %e, "Dispatch failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error.\n").into_response()
        }
    }
}

fn decode_worker(body: &[u8]) -> Result<Worker, BalancerError> {
    serde_json::from_slice(body).map_err(|e| BalancerError::DecodeError(e.to_string()))
}

fn invalid_payload(e: BalancerError) -> Response {
    warn!(error = %e, "Rejected worker payload");
    (StatusCode::BAD_REQUEST, "Invalid post data").into_response()
}

/// Appends a worker to its host. Duplicates are accepted.
async fn handle_register(State(registry): State<Arc<WorkerRegistry>>, body: Bytes) -> Response {
    let worker = match decode_worker(&body) {
        Ok(worker) => worker,
        Err(e) => return invalid_payload(e),
    };
    let (host, address) = (worker.host.clone(), worker.address.clone());
    let count = registry.add(&host, worker);
    info!(host = %host, address = %address, workers = count, "Registered worker via API");
    format!(
        "added worker {} to workers for host {}. There are now {} workers for {}\n",
        address, host, count, host
    )
    .into_response()
}

/// Removes the first matching worker. Always 200, even when nothing matched.
async fn handle_deregister(State(registry): State<Arc<WorkerRegistry>>, body: Bytes) -> Response {
    let worker = match decode_worker(&body) {
        Ok(worker) => worker,
        Err(e) => return invalid_payload(e),
    };
    let count = registry.remove(&worker);
    format!(
        "removed worker {} from workers for host {}. There are now {} workers for {}\n",
        worker.address, worker.host, count, worker.host
    )
    .into_response()
}

/// Returns every known host with its workers and cursor.
async fn handle_status(State(registry): State<Arc<WorkerRegistry>>) -> impl IntoResponse {
    Json(json!({ "hosts": registry.snapshot() }))
}

/// Liveness of the balancer itself. Workers are never checked.
async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

/// Exposes Prometheus metrics.
async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer)
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain".to_string())],
                format!("Error encoding metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Serves `router` on an ephemeral localhost port and returns its address.
#[cfg(test)]
pub(crate) fn spawn_server(router: Router) -> std::net::SocketAddr {
    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
        .serve(router.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });
    addr
}
