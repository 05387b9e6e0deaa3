//! HTTP server setup and lifecycle.
//!
//! # Responsibilities
//! - Build the Axum router with the context and tracing layers
//! - Bind the listener and serve until shutdown
//! - Enrich each request with its per-request context
//! - Graceful shutdown with a hard 30-second drain deadline
//!
//! # Design Decisions
//! - The context layer runs before anything else so every code path,
//!   including errors, has a request id
//! - In-flight requests get the full grace period; afterwards the
//!   process exits and drops whatever remains

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::routing::any;
use axum::Router;
use http::Request;
use tokio::net::TcpListener;
use tower::{Layer, Service};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::config::{ConfigStore, Snapshot};
use crate::context::{RequestContext, X_REQUEST_ID};
use crate::lifecycle::Shutdown;
use crate::observability::MetricsRecorder;
use crate::plugin::AppAccessor;
use crate::router::{dispatch, AppState};

/// How long in-flight requests may drain after the shutdown signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The gateway's HTTP server.
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Build the Axum router with all middleware layers.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/{*path}", any(dispatch))
            .route("/", any(dispatch))
            .with_state(Arc::clone(&self.state))
            .layer(CatchPanicLayer::custom(handle_panic))
            .layer(RequestContextLayer)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until the shutdown signal fires, then drain in-flight
    /// requests for up to [`SHUTDOWN_GRACE`] before giving up.
    pub async fn run(self, listener: TcpListener, shutdown: Arc<Shutdown>) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Gateway listening");

        let mut drain_signal = shutdown.subscribe();
        let mut force_signal = shutdown.subscribe();

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = drain_signal.recv().await;
        });

        tokio::select! {
            result = serve => {
                tracing::info!("Gateway stopped");
                result
            }
            _ = async {
                let _ = force_signal.recv().await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => {
                tracing::warn!(
                    grace_secs = SHUTDOWN_GRACE.as_secs(),
                    "Drain deadline exceeded, forcing shutdown"
                );
                Ok(())
            }
        }
    }
}

/// A panicking middleware or plugin must not take the server down; the
/// client gets the standard 500 envelope instead.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> http::Response<Body> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "Handler panicked");
    crate::response::error_body::error_response(
        http::StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error",
        None,
        None,
    )
}

/// Application surface handed to plugins during init.
pub struct GatewayApp {
    pub store: Arc<ConfigStore>,
    pub metrics: Arc<dyn MetricsRecorder>,
}

impl AppAccessor for GatewayApp {
    fn snapshot(&self) -> Arc<Snapshot> {
        self.store.current()
    }

    fn metrics(&self) -> Arc<dyn MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

/// Tower layer attaching a [`RequestContext`] to every request.
#[derive(Clone, Copy, Debug)]
pub struct RequestContextLayer;

impl<S> Layer<S> for RequestContextLayer {
    type Service = RequestContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestContextService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct RequestContextService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestContextService<S>
where
    S: Service<Request<Body>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let ctx = build_context(&req);
        req.extensions_mut().insert(ctx);
        self.inner.call(req)
    }
}

fn build_context(req: &Request<Body>) -> RequestContext {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|id| is_usable_request_id(id))
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let original_host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default();

    let original_scheme = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|proto| !proto.is_empty())
        .unwrap_or("http")
        .to_string();

    let peer_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    RequestContext {
        request_id,
        start: Instant::now(),
        original_host,
        original_scheme,
        peer_addr,
    }
}

/// A client-supplied request id is used only when it is short and clean
/// enough to echo into headers and logs.
fn is_usable_request_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 128 && id.chars().all(|c| c.is_ascii_graphic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_request_id_is_reused() {
        let req = Request::builder()
            .uri("/x")
            .header(X_REQUEST_ID, "client-id-42")
            .body(Body::empty())
            .unwrap();
        assert_eq!(build_context(&req).request_id, "client-id-42");
    }

    #[test]
    fn missing_request_id_is_generated_unique() {
        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let a = build_context(&req).request_id;
        let b = build_context(&req).request_id;
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_request_id_is_replaced() {
        let req = Request::builder()
            .uri("/x")
            .header(X_REQUEST_ID, "bad id with spaces")
            .body(Body::empty())
            .unwrap();
        assert_ne!(build_context(&req).request_id, "bad id with spaces");
    }

    #[test]
    fn forwarded_proto_is_honoured() {
        let req = Request::builder()
            .uri("/x")
            .header("x-forwarded-proto", "https")
            .header(http::header::HOST, "edge.example")
            .body(Body::empty())
            .unwrap();
        let ctx = build_context(&req);
        assert_eq!(ctx.original_scheme, "https");
        assert_eq!(ctx.original_host, "edge.example");
    }
}
