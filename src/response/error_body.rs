//! JSON error payloads sent to clients.
//!
//! Two shapes leave this module: the response-limit 413 body, which is
//! hand-formatted so its byte length (and therefore `Content-Length`) is
//! stable, and the generic error envelope used everywhere else.

use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

/// Body for a response that breached its configured size limit.
///
/// Hand-crafted rather than serialised so key order and spacing never
/// drift: the declared `Content-Length` must match these bytes exactly.
pub fn limit_exceeded_body(limit_bytes: u64, path: &str) -> String {
    format!(
        "{{\"error\":{{\"code\":413,\"message\":\"Response body size exceeds limit\",\"details\":{{\"limit_bytes\":{},\"path\":\"{}\"}}}}}}",
        limit_bytes, path
    )
}

/// Headers that accompany every limit-exceeded 413.
pub fn limit_exceeded_headers(body_len: usize) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    headers
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

/// Standard error envelope: `{"error":{...},"request_id":...,"timestamp":...}`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    timestamp: u64,
}

impl ErrorEnvelope {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: status.as_u16(),
                message: message.into(),
                details: None,
            },
            request_id: None,
            timestamp: unix_now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn to_json(&self) -> String {
        // The envelope contains only strings and numbers; serialisation
        // cannot fail for these inputs.
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\":{{\"code\":{},\"message\":\"Internal Server Error\"}},\"timestamp\":{}}}",
                self.error.code,
                unix_now()
            )
        })
    }
}

/// Complete JSON error response with the envelope shape and the headers
/// every gateway-originated error carries.
pub fn error_response(
    status: StatusCode,
    message: &str,
    details: Option<serde_json::Value>,
    request_id: Option<&str>,
) -> axum::response::Response {
    let mut envelope = ErrorEnvelope::new(status, message);
    if let Some(details) = details {
        envelope = envelope.with_details(details);
    }
    if let Some(id) = request_id {
        envelope = envelope.with_request_id(id);
    }
    let body = envelope.to_json();

    let mut builder = axum::response::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, CONTENT_TYPE_JSON)
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .header(
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate",
        )
        .header(header::CONTENT_LENGTH, body.len());
    if let Some(id) = request_id {
        builder = builder.header("x-request-id", id);
    }

    builder
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| {
            // Only reachable with a request id that is not a legal header
            // value; degrade to a bare status.
            let mut response = axum::response::Response::new(axum::body::Body::empty());
            *response.status_mut() = status;
            response
        })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
