//! Per-request upstream round-tripper.
//!
//! # Responsibilities
//! - Resolve the effective transport config (route override or defaults)
//! - Inject forwarded-for headers and apply the route's header policy
//! - Execute the request through the cached client
//! - Classify failures for the engine's status mapping

use std::collections::HashSet;
use std::time::Duration;

use axum::body::Body;
use http::header::{HeaderName, HeaderValue, HOST};
use http::Request;
use hyper::body::Incoming;

use crate::config::loader::CompiledRoute;
use crate::config::schema::HttpTransportConfig;
use crate::context::RequestContext;
use crate::transport::cache::{TransportCache, TransportError};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream transport could not be built: {0}")]
    Build(#[from] TransportError),

    #[error("timed out waiting for the upstream")]
    Timeout,

    #[error("request was cancelled")]
    Canceled,

    #[error("upstream request failed: {0}")]
    Network(#[source] hyper_util::client::legacy::Error),
}

impl UpstreamError {
    pub fn status(&self) -> http::StatusCode {
        match self {
            UpstreamError::Timeout => http::StatusCode::GATEWAY_TIMEOUT,
            UpstreamError::Canceled => http::StatusCode::REQUEST_TIMEOUT,
            _ => http::StatusCode::BAD_GATEWAY,
        }
    }

    pub fn public_message(&self) -> &'static str {
        match self {
            UpstreamError::Timeout => "Gateway Timeout",
            UpstreamError::Canceled => "Request Timeout",
            _ => "Bad Gateway",
        }
    }
}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(e: hyper_util::client::legacy::Error) -> Self {
        let canceled = std::error::Error::source(&e)
            .and_then(|s| s.downcast_ref::<hyper::Error>())
            .map(|h| h.is_canceled())
            .unwrap_or(false);
        if canceled {
            UpstreamError::Canceled
        } else {
            UpstreamError::Network(e)
        }
    }
}

/// Round-tripper bound to one matched route and the active snapshot.
pub struct UpstreamTransport<'a> {
    route: &'a CompiledRoute,
    defaults: &'a HttpTransportConfig,
    cache: &'a TransportCache,
}

impl<'a> UpstreamTransport<'a> {
    pub fn new(
        route: &'a CompiledRoute,
        defaults: &'a HttpTransportConfig,
        cache: &'a TransportCache,
    ) -> Self {
        Self {
            route,
            defaults,
            cache,
        }
    }

    /// The route's transport override replaces the defaults wholesale.
    pub fn effective_config(&self) -> &HttpTransportConfig {
        self.route
            .config
            .transport
            .as_ref()
            .map(|t| &t.http)
            .unwrap_or(self.defaults)
    }

    /// Apply the route's header policy and forwarding headers, then
    /// execute the request through the cached transport.
    pub async fn round_trip(
        &self,
        mut req: Request<Body>,
        ctx: &RequestContext,
    ) -> Result<http::Response<Incoming>, UpstreamError> {
        rewrite_headers(&mut req, self.route, ctx);

        let config = self.effective_config();
        let client = self.cache.get_or_build(config)?;

        let response = if config.response_header_timeout_secs > 0 {
            let budget = Duration::from_secs(config.response_header_timeout_secs);
            tokio::time::timeout(budget, client.request(req))
                .await
                .map_err(|_| UpstreamError::Timeout)??
        } else {
            client.request(req).await?
        };

        Ok(response)
    }
}

/// Forwarding headers and the route's add/remove policy. Applied once per
/// request, after the director rewrote the URI.
pub fn rewrite_headers(req: &mut Request<Body>, route: &CompiledRoute, ctx: &RequestContext) {
    let excluded: HashSet<String> = route
        .config
        .excluded_headers
        .iter()
        .map(|name| name.to_ascii_lowercase())
        .collect();

    let headers = req.headers_mut();

    if !excluded.contains(X_FORWARDED_FOR) {
        if let Some(peer) = ctx.peer_addr {
            let ip = peer.ip().to_string();
            let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) if !existing.is_empty() => format!("{}, {}", existing, ip),
                _ => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
    }
    if !excluded.contains(X_FORWARDED_PROTO) {
        if let Ok(value) = HeaderValue::from_str(&ctx.original_scheme) {
            headers.insert(X_FORWARDED_PROTO, value);
        }
    }
    if !excluded.contains(X_FORWARDED_HOST) && !ctx.original_host.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&ctx.original_host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
    }

    for name in &excluded {
        if let Ok(name) = name.parse::<HeaderName>() {
            headers.remove(name);
        }
    }

    for (name, value) in &route.config.additional_headers {
        let Ok(value) = HeaderValue::from_str(value) else {
            tracing::warn!(header = %name, "Skipping additional header with invalid value");
            continue;
        };
        if name.eq_ignore_ascii_case("host") {
            headers.insert(HOST, value);
        } else if let Ok(name) = name.parse::<HeaderName>() {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_config;

    fn route_with(additional: &[(&str, &str)], excluded: &[&str]) -> CompiledRoute {
        let mut yaml = String::from(
            "listen_port: \"8080\"\nlocations:\n  - path: \"^/api\"\n    target_url: \"http://127.0.0.1:9000\"\n",
        );
        if !additional.is_empty() {
            yaml.push_str("    additional_headers:\n");
            for (k, v) in additional {
                yaml.push_str(&format!("      {}: \"{}\"\n", k, v));
            }
        }
        if !excluded.is_empty() {
            yaml.push_str("    excluded_headers:\n");
            for name in excluded {
                yaml.push_str(&format!("      - \"{}\"\n", name));
            }
        }
        parse_config(&yaml).unwrap().routes.remove(0)
    }

    fn ctx() -> RequestContext {
        RequestContext {
            request_id: "test".into(),
            original_host: "public.example".into(),
            original_scheme: "https".into(),
            peer_addr: Some("10.0.0.9:55000".parse().unwrap()),
            ..RequestContext::default()
        }
    }

    #[test]
    fn forwarding_headers_are_set() {
        let route = route_with(&[], &[]);
        let mut req = Request::builder().uri("/api").body(Body::empty()).unwrap();
        rewrite_headers(&mut req, &route, &ctx());

        assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "10.0.0.9");
        assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(req.headers().get(X_FORWARDED_HOST).unwrap(), "public.example");
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let route = route_with(&[], &[]);
        let mut req = Request::builder()
            .uri("/api")
            .header(X_FORWARDED_FOR, "203.0.113.7")
            .body(Body::empty())
            .unwrap();
        rewrite_headers(&mut req, &route, &ctx());
        assert_eq!(
            req.headers().get(X_FORWARDED_FOR).unwrap(),
            "203.0.113.7, 10.0.0.9"
        );
    }

    #[test]
    fn excluded_headers_are_removed() {
        let route = route_with(&[], &["x-internal-token", "x-forwarded-for"]);
        let mut req = Request::builder()
            .uri("/api")
            .header("x-internal-token", "secret")
            .body(Body::empty())
            .unwrap();
        rewrite_headers(&mut req, &route, &ctx());

        assert!(req.headers().get("x-internal-token").is_none());
        assert!(req.headers().get(X_FORWARDED_FOR).is_none());
    }

    #[test]
    fn additional_headers_override_and_host_is_special() {
        let route = route_with(&[("X-Env", "prod"), ("Host", "internal.example")], &[]);
        let mut req = Request::builder()
            .uri("/api")
            .header("x-env", "stale")
            .body(Body::empty())
            .unwrap();
        rewrite_headers(&mut req, &route, &ctx());

        assert_eq!(req.headers().get("x-env").unwrap(), "prod");
        assert_eq!(req.headers().get(HOST).unwrap(), "internal.example");
    }

    #[test]
    fn rewrite_is_idempotent_over_the_excluded_set() {
        let route = route_with(&[("X-Env", "prod")], &["x-secret", "x-forwarded-for"]);
        let mut once = Request::builder()
            .uri("/api")
            .header("x-secret", "s")
            .body(Body::empty())
            .unwrap();
        rewrite_headers(&mut once, &route, &ctx());
        let mut twice_headers = once.headers().clone();

        rewrite_headers(&mut once, &route, &ctx());
        std::mem::swap(&mut twice_headers, once.headers_mut());
        // Swapped: `once` now holds the single-pass headers again.
        assert_eq!(once.headers(), &twice_headers);
    }

    #[test]
    fn override_replaces_defaults_wholesale() {
        let yaml = r#"
listen_port: "8080"
transport:
  http:
    idle_conn_timeout_secs: 90
    force_http2: true
locations:
  - path: "^/x"
    target_url: "http://127.0.0.1:9000"
    transport:
      http:
        idle_conn_timeout_secs: 5
"#;
        let snapshot = parse_config(yaml).unwrap();
        let cache = TransportCache::new();
        let transport =
            UpstreamTransport::new(&snapshot.routes[0], &snapshot.config.transport.http, &cache);
        let effective = transport.effective_config();
        assert_eq!(effective.idle_conn_timeout_secs, 5);
        // The override is not merged with defaults; unset fields fall back
        // to the schema defaults.
        assert!(!effective.force_http2);
    }
}
