//! Request dispatch.
//!
//! # Responsibilities
//! - Serve the metrics endpoint when enabled
//! - Enforce the client request body cap
//! - First-match route scan over the active snapshot
//! - Hand WebSocket upgrades to the relay, everything else to the
//!   middleware chain around the proxy engine
//!
//! # Design Decisions
//! - The snapshot is captured once per request; a reload mid-flight never
//!   changes the route table this request sees

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use http::{header, Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::ConfigStore;
use crate::context::RequestContext;
use crate::observability::MetricsRecorder;
use crate::plugin::{build_chain, PluginRegistry};
use crate::proxy::{BufferPool, ProxyEngine};
use crate::response::error_body;
use crate::websocket;

/// Hard cap on client request bodies.
pub const MAX_REQUEST_BODY_BYTES: u64 = 10 * 1024 * 1024;

/// Everything a request needs, shared across the listener.
pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub plugins: Arc<PluginRegistry>,
    pub metrics: Arc<dyn MetricsRecorder>,
    pub buffers: Arc<BufferPool>,
    /// Prometheus exposition handle; `None` when metrics are disabled.
    pub exposition: Option<PrometheusHandle>,
}

/// Top-level request handler behind the context layer.
pub async fn dispatch(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    let snapshot = state.store.current();
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();
    let path = req.uri().path().to_string();

    if snapshot.config.metrics.enabled && path == snapshot.config.metrics.path {
        return render_metrics(&state);
    }

    if let Some(length) = content_length(&req) {
        if length > MAX_REQUEST_BODY_BYTES {
            state.metrics.record_error("request_too_large");
            return error_body::error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                None,
                Some(&ctx.request_id),
            );
        }
        if length > 0 {
            state.metrics.record_bytes("inbound", length);
        }
    }

    for (index, route) in snapshot.routes.iter().enumerate() {
        if !route.pattern.is_match(&path) {
            continue;
        }

        if route.config.enable_websocket && websocket::is_upgrade_request(&req) {
            return websocket::handle_upgrade(req, route, Arc::clone(&state.metrics)).await;
        }

        let engine = ProxyEngine::new(
            Arc::clone(&snapshot),
            index,
            Arc::clone(state.store.transports()),
            Arc::clone(&state.metrics),
            Arc::clone(&state.buffers),
        );
        let handler = build_chain(route, &state.plugins, Arc::new(engine));

        state.metrics.update_active(1);
        let response = handler.call(req).await;
        state.metrics.update_active(-1);
        return response;
    }

    tracing::debug!(path = %path, request_id = %ctx.request_id, "No route matched");
    state.metrics.record_error("no_route");
    error_body::error_response(
        StatusCode::NOT_FOUND,
        "Not Found",
        None,
        Some(&ctx.request_id),
    )
}

fn render_metrics(state: &AppState) -> Response {
    match &state.exposition {
        Some(handle) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn content_length(req: &Request<Body>) -> Option<u64> {
    req.headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
