//! Reverse-proxy engine for one matched route.
//!
//! # Responsibilities
//! - Director: rewrite scheme/host/path/query and sanitise headers
//! - Dispatch through the upstream transport under the request timeout
//! - Relay the response body through the limit interceptor and sink
//! - Map upstream failures to 504/408/502 JSON errors
//!
//! # Design Decisions
//! - The engine returns a streaming response as soon as the pipeline
//!   commits headers; the body relay continues on its own task
//! - Once a 413 replacement is committed, no other error is emitted
//! - An overflow after commit tears the client connection rather than
//!   corrupting the response

use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use futures_util::future::BoxFuture;
use http::header::{self, HeaderMap, HeaderName, HeaderValue, HOST};
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::loader::{CompiledRoute, Snapshot};
use crate::context::RequestContext;
use crate::observability::MetricsRecorder;
use crate::proxy::buffer_pool::BufferPool;
use crate::proxy::Handler;
use crate::response::error_body::{self, ErrorEnvelope, CONTENT_TYPE_JSON};
use crate::response::limit::LimitInterceptor;
use crate::response::sink::{ChannelTarget, ResponseSink, SinkMetrics, SinkOptions};
use crate::transport::{TransportCache, UpstreamError, UpstreamTransport};

/// Request headers whose scope is the client-gateway leg only.
const HOP_BY_HOP_REQUEST: &[&str] = &[
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "connection",
];

/// Response headers that must not be forwarded. `Transfer-Encoding` is
/// intentionally kept: the sink inspects it and the channel target strips
/// it before the response leaves the gateway.
const HOP_BY_HOP_RESPONSE: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Per-route proxy handler; the innermost element of the middleware chain.
#[derive(Clone)]
pub struct ProxyEngine {
    snapshot: Arc<Snapshot>,
    route_index: usize,
    transports: Arc<TransportCache>,
    metrics: Arc<dyn MetricsRecorder>,
    buffers: Arc<BufferPool>,
}

impl Handler for ProxyEngine {
    fn call(&self, req: Request<Body>) -> BoxFuture<'static, Response> {
        let engine = self.clone();
        Box::pin(async move { engine.serve(req).await })
    }
}

impl ProxyEngine {
    pub fn new(
        snapshot: Arc<Snapshot>,
        route_index: usize,
        transports: Arc<TransportCache>,
        metrics: Arc<dyn MetricsRecorder>,
        buffers: Arc<BufferPool>,
    ) -> Self {
        Self {
            snapshot,
            route_index,
            transports,
            metrics,
            buffers,
        }
    }

    fn route(&self) -> &CompiledRoute {
        &self.snapshot.routes[self.route_index]
    }

    async fn serve(&self, mut req: Request<Body>) -> Response {
        let ctx = req
            .extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default();
        let route = self.route();
        let method = req.method().to_string();
        let original_path = req.uri().path().to_string();
        let deadline = tokio::time::Instant::now() + self.snapshot.config.request_timeout();

        if rewrite_request(&mut req, route, &ctx).is_err() {
            tracing::error!(
                target_url = %route.config.target_url,
                path = %original_path,
                "Target URL cannot be applied to the request"
            );
            self.metrics.record_error("config");
            return error_body::error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error",
                None,
                Some(&ctx.request_id),
            );
        }

        let transport = UpstreamTransport::new(
            route,
            &self.snapshot.config.transport.http,
            &self.transports,
        );
        let outcome = tokio::time::timeout_at(deadline, transport.round_trip(req, &ctx)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout),
        };

        let upstream = match result {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %original_path,
                    method = %method,
                    request_id = %ctx.request_id,
                    "Proxy error"
                );
                self.metrics.record_error(error_kind(&e));
                self.metrics.record_request(
                    &method,
                    &original_path,
                    e.status().as_u16(),
                    ctx.start.elapsed(),
                );
                return error_body::error_response(
                    e.status(),
                    e.public_message(),
                    Some(json!({ "upstream_error": e.to_string() })),
                    Some(&ctx.request_id),
                );
            }
        };

        // Upstream answered: build the response pipeline and relay the
        // body on its own task while the client handler waits for the
        // committed head.
        let (parts, upstream_body) = upstream.into_parts();

        let (head_tx, head_rx) = tokio::sync::oneshot::channel();
        let (body_tx, body_rx) = tokio::sync::mpsc::channel(32);
        let target = ChannelTarget::new(head_tx, body_tx);

        let options = SinkOptions {
            enable_buffering: !route.config.disable_response_buffering,
            ..SinkOptions::default()
        };
        let mut sink = ResponseSink::new(Box::new(target), options, Arc::clone(&self.buffers));

        copy_response_headers(sink.headers_mut(), &parts.headers);
        apply_response_headers(sink.headers_mut(), &ctx);

        let limit = route
            .config
            .effective_max_response_body_size(self.snapshot.config.response_limits.max_response_body_size);
        let pipeline = if limit > 0 {
            ResponsePipeline::Limited(LimitInterceptor::new(sink, limit, original_path.clone()))
        } else {
            ResponsePipeline::Direct(sink)
        };

        let relay = Relay {
            pipeline,
            metrics: Arc::clone(&self.metrics),
            ctx: ctx.clone(),
            method,
            path: original_path,
        };
        tokio::spawn(relay.run(parts.status, upstream_body, deadline));

        match head_rx.await {
            Ok(head) => {
                let mut response = Response::new(Body::from_stream(ReceiverStream::new(body_rx)));
                *response.status_mut() = head.status;
                *response.headers_mut() = head.headers;
                response
            }
            Err(_) => {
                // The relay task died before committing a head.
                self.metrics.record_error("internal");
                error_body::error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    None,
                    Some(&ctx.request_id),
                )
            }
        }
    }
}

/// Body relay: drives upstream frames through the pipeline until the body
/// ends, the limit trips, the client leaves, or the deadline passes.
struct Relay {
    pipeline: ResponsePipeline,
    metrics: Arc<dyn MetricsRecorder>,
    ctx: RequestContext,
    method: String,
    path: String,
}

impl Relay {
    async fn run(mut self, status: StatusCode, mut body: Incoming, deadline: tokio::time::Instant) {
        self.pipeline.write_header(status).await;
        if self.pipeline.limit_rejected() {
            self.metrics.record_limit_exceeded(&self.path);
            self.finish().await;
            return;
        }

        loop {
            let frame = match tokio::time::timeout_at(deadline, body.frame()).await {
                Err(_) => {
                    self.fail_midstream(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout", "upstream_timeout")
                        .await;
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::error!(
                        error = %e,
                        path = %self.path,
                        request_id = %self.ctx.request_id,
                        "Upstream body failed mid-stream"
                    );
                    self.fail_midstream(StatusCode::BAD_GATEWAY, "Bad Gateway", "upstream_body")
                        .await;
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let Ok(data) = frame.into_data() else {
                // Trailers are not forwarded.
                continue;
            };

            match self.pipeline.write(&data).await {
                Ok(_) => {
                    if self.pipeline.target_failed() {
                        tracing::debug!(
                            request_id = %self.ctx.request_id,
                            "Client went away mid-response"
                        );
                        self.metrics.record_error("client_closed");
                        break;
                    }
                }
                Err(exceeded) => {
                    self.metrics.record_limit_exceeded(&self.path);
                    if !exceeded.rejected {
                        // Headers were already on the wire; the only safe
                        // signal left is tearing the connection.
                        self.pipeline.abort().await;
                    }
                    break;
                }
            }
        }

        self.finish().await;
    }

    /// Mid-stream failure: replace the response when nothing reached the
    /// client yet, otherwise tear the connection. Never runs over a
    /// committed 413.
    async fn fail_midstream(&mut self, status: StatusCode, message: &str, kind: &str) {
        self.metrics.record_error(kind);
        if self.pipeline.limit_rejected() {
            return;
        }
        if self.pipeline.committed() {
            self.pipeline.abort().await;
            return;
        }
        let body = ErrorEnvelope::new(status, message)
            .with_request_id(self.ctx.request_id.clone())
            .to_json();
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
        headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.pipeline
            .replace_response(status, headers, body.as_bytes())
            .await;
    }

    async fn finish(&mut self) {
        self.pipeline.finish().await;
        let metrics = self.pipeline.sink_metrics();
        self.metrics.record_request(
            &self.method,
            &self.path,
            metrics.status_code,
            self.ctx.start.elapsed(),
        );
        if metrics.bytes_written > 0 {
            self.metrics.record_bytes("outbound", metrics.bytes_written);
        }
        tracing::info!(
            method = %self.method,
            path = %self.path,
            status = metrics.status_code,
            bytes = metrics.bytes_written,
            duration_ms = format!("{:.3}", self.ctx.elapsed_ms()),
            request_id = %self.ctx.request_id,
            "Request completed"
        );
    }
}

/// The response pipeline: a sink, optionally behind a limit interceptor.
enum ResponsePipeline {
    Direct(ResponseSink),
    Limited(LimitInterceptor),
}

impl ResponsePipeline {
    async fn write_header(&mut self, status: StatusCode) {
        match self {
            ResponsePipeline::Direct(sink) => sink.write_header(status).await,
            ResponsePipeline::Limited(li) => li.write_header(status).await,
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, crate::response::limit::LimitExceeded> {
        match self {
            ResponsePipeline::Direct(sink) => Ok(sink.write(buf).await),
            ResponsePipeline::Limited(li) => li.write(buf).await,
        }
    }

    async fn finish(&mut self) {
        match self {
            ResponsePipeline::Direct(sink) => sink.flush().await,
            ResponsePipeline::Limited(li) => li.flush().await,
        }
    }

    async fn abort(&mut self) {
        match self {
            ResponsePipeline::Direct(sink) => sink.abort().await,
            ResponsePipeline::Limited(li) => li.sink_mut().abort().await,
        }
    }

    async fn replace_response(&mut self, status: StatusCode, headers: HeaderMap, body: &[u8]) {
        match self {
            ResponsePipeline::Direct(sink) => {
                if sink.headers_written() {
                    sink.abort().await;
                    return;
                }
                let sink_headers = sink.headers_mut();
                sink_headers.clear();
                sink_headers.extend(headers);
                sink.write_header(status).await;
                sink.write(body).await;
            }
            ResponsePipeline::Limited(li) => li.replace_response(status, headers, body).await,
        }
    }

    fn limit_rejected(&self) -> bool {
        match self {
            ResponsePipeline::Direct(_) => false,
            ResponsePipeline::Limited(li) => li.rejected(),
        }
    }

    /// Whether the original headers are already on the wire.
    fn committed(&self) -> bool {
        match self {
            ResponsePipeline::Direct(sink) => sink.headers_written(),
            ResponsePipeline::Limited(li) => li.headers_committed(),
        }
    }

    fn target_failed(&self) -> bool {
        match self {
            ResponsePipeline::Direct(sink) => sink.target_failed(),
            ResponsePipeline::Limited(li) => li.sink().target_failed(),
        }
    }

    fn sink_metrics(&self) -> SinkMetrics {
        match self {
            ResponsePipeline::Direct(sink) => sink.metrics(),
            ResponsePipeline::Limited(li) => li.sink().metrics(),
        }
    }
}

/// Director: point the request at the route's target.
fn rewrite_request(
    req: &mut Request<Body>,
    route: &CompiledRoute,
    ctx: &RequestContext,
) -> Result<(), http::Error> {
    let target = &route.target;

    let path = if route.config.replace_path {
        target.path().to_string()
    } else {
        join_paths(target.path(), route.strip_matched_prefix(req.uri().path()))
    };
    let path_and_query = match req.uri().query() {
        Some(query) if !query.is_empty() => format!("{}?{}", path, query),
        _ => path,
    };

    let authority = match target.port() {
        Some(port) => format!("{}:{}", target.host_str().unwrap_or_default(), port),
        None => target.host_str().unwrap_or_default().to_string(),
    };

    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(Scheme::try_from(target.scheme())?);
    parts.authority = Some(Authority::try_from(authority.as_str())?);
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query.as_str())?);
    *req.uri_mut() = Uri::from_parts(parts)?;

    let headers = req.headers_mut();
    headers.insert(HOST, HeaderValue::from_str(&authority)?);
    for name in HOP_BY_HOP_REQUEST {
        headers.remove(*name);
    }
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(crate::context::X_REQUEST_ID, value);
    }

    Ok(())
}

/// Join two path segments with exactly one separator.
fn join_paths(base: &str, rest: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        rest.trim_start_matches('/')
    )
}

fn copy_response_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        if HOP_BY_HOP_RESPONSE.contains(&name.as_str()) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// Security headers (if absent) plus per-request identification.
fn apply_response_headers(headers: &mut HeaderMap, ctx: &RequestContext) {
    set_if_absent(headers, header::X_CONTENT_TYPE_OPTIONS, "nosniff");
    set_if_absent(headers, header::X_FRAME_OPTIONS, "DENY");
    set_if_absent(headers, header::REFERRER_POLICY, "strict-origin-when-cross-origin");
    set_if_absent(
        headers,
        header::STRICT_TRANSPORT_SECURITY,
        "max-age=31536000; includeSubDomains",
    );

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(crate::context::X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{:.3}ms", ctx.elapsed_ms())) {
        headers.insert("x-response-time", value);
    }
}

fn set_if_absent(headers: &mut HeaderMap, name: HeaderName, value: &'static str) {
    if !headers.contains_key(&name) {
        headers.insert(name, HeaderValue::from_static(value));
    }
}

fn error_kind(e: &UpstreamError) -> &'static str {
    match e {
        UpstreamError::Timeout => "upstream_timeout",
        UpstreamError::Canceled => "request_canceled",
        UpstreamError::Build(_) => "transport_build",
        UpstreamError::Network(_) => "upstream_network",
    }
}
