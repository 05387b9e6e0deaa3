//! Request-scoped context.
//!
//! Attached to every request as an extension before routing, and read by
//! the proxy pipeline for forwarding headers, error bodies, and timing.

use std::net::SocketAddr;
use std::time::Instant;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Metadata carried through one request's lifetime.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Client-supplied `X-Request-ID`, or a generated UUID v4.
    pub request_id: String,

    /// When the gateway accepted the request.
    pub start: Instant,

    /// Host header as the client sent it.
    pub original_host: String,

    /// Scheme the client used, honouring an incoming `X-Forwarded-Proto`.
    pub original_scheme: String,

    /// Peer address of the client connection.
    pub peer_addr: Option<SocketAddr>,
}

impl RequestContext {
    /// Milliseconds elapsed since the request was accepted.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            start: Instant::now(),
            original_host: String::new(),
            original_scheme: "http".to_string(),
            peer_addr: None,
        }
    }
}
