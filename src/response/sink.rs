//! Client-facing response writer.
//!
//! # Responsibilities
//! - Capture the status code, enforcing a single header emission
//! - Decide from response headers whether to capture the body in memory
//! - Count bytes, switch to streaming past the threshold, expose metrics
//! - Stand alone as a size limiter when no interceptor wraps it
//!
//! # Design Decisions
//! - The sink writes *through* to a `ResponseTarget`; capturing is
//!   observational and never delays delivery
//! - Exclusive ownership (`&mut self`) serialises all operations, so the
//!   once-guard is a plain flag rather than a lock
//! - Target failures (client gone) are recorded, not propagated; the relay
//!   polls `target_failed` to stop reading the upstream

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::proxy::buffer_pool::BufferPool;
use crate::response::buffer::LimitedBuffer;

/// Buffered-capture ceiling before a response is treated as streaming.
pub const STREAMING_THRESHOLD: usize = 512 * 1024;

/// Default capacity of the capture buffer.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 1024 * 1024;

/// Raw duplex stream handed out by a successful hijack.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("operation not supported by the underlying response target")]
    NotSupported,
}

/// Status line and headers of a response, sent once per exchange.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Destination the sink writes into. The production implementation feeds a
/// channel-backed streaming body; tests record what they receive.
#[async_trait]
pub trait ResponseTarget: Send {
    /// Deliver the status and headers. Called exactly once.
    async fn send_head(&mut self, head: ResponseHead) -> io::Result<()>;

    /// Deliver one chunk of body bytes.
    async fn send_data(&mut self, data: Bytes) -> io::Result<()>;

    /// Abort the in-flight body, tearing the client connection.
    async fn abort(&mut self);

    /// Take over the raw connection, if the target supports it.
    fn hijack(&mut self) -> Result<Box<dyn RawStream>, SinkError> {
        Err(SinkError::NotSupported)
    }

    /// Initiate a server push, if the target supports it.
    fn push(&mut self, _path: &str) -> Result<(), SinkError> {
        Err(SinkError::NotSupported)
    }
}

/// Per-response sink configuration.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Capture-buffer capacity.
    pub max_buffer_bytes: usize,
    /// Master switch for body capturing.
    pub enable_buffering: bool,
    /// Standalone body cap; 0 means unlimited. Left at 0 when a limit
    /// interceptor owns enforcement.
    pub max_response_body_bytes: u64,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            enable_buffering: true,
            max_response_body_bytes: 0,
        }
    }
}

/// Snapshot of a sink's counters.
#[derive(Debug, Clone)]
pub struct SinkMetrics {
    pub status_code: u16,
    pub bytes_written: u64,
    pub buffered_bytes: usize,
    pub streaming: bool,
    pub buffer_truncated: bool,
}

pub struct ResponseSink {
    target: Box<dyn ResponseTarget>,
    options: SinkOptions,
    headers: HeaderMap,
    status: Option<StatusCode>,
    headers_written: bool,
    should_buffer: bool,
    streaming: bool,
    buffer_truncated: bool,
    capture: LimitedBuffer,
    bytes_written: u64,
    limit_hit: bool,
    error_body_written: bool,
    target_failed: bool,
    scratch: BytesMut,
    pool: Arc<BufferPool>,
}

impl ResponseSink {
    pub fn new(target: Box<dyn ResponseTarget>, options: SinkOptions, pool: Arc<BufferPool>) -> Self {
        let capture = LimitedBuffer::new(options.max_buffer_bytes);
        let scratch = pool.get();
        Self {
            target,
            options,
            headers: HeaderMap::new(),
            status: None,
            headers_written: false,
            should_buffer: false,
            streaming: false,
            buffer_truncated: false,
            capture,
            bytes_written: 0,
            limit_hit: false,
            error_body_written: false,
            target_failed: false,
            scratch,
            pool,
        }
    }

    /// Response headers, mutable until the first `write_header`.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_written(&self) -> bool {
        self.headers_written
    }

    /// True when the body is passing straight through: capture was never
    /// enabled for this response, or it was abandoned past the threshold.
    pub fn is_streaming(&self) -> bool {
        self.headers_written && (!self.should_buffer || self.streaming)
    }

    pub fn is_buffer_truncated(&self) -> bool {
        self.buffer_truncated || self.capture.is_overflow()
    }

    pub fn target_failed(&self) -> bool {
        self.target_failed
    }

    /// Copy of the captured body so far.
    pub fn buffered_body(&self) -> Vec<u8> {
        self.capture.snapshot_bytes()
    }

    pub fn metrics(&self) -> SinkMetrics {
        SinkMetrics {
            status_code: self.status.map(|s| s.as_u16()).unwrap_or(0),
            bytes_written: self.bytes_written,
            buffered_bytes: self.capture.length(),
            streaming: self.is_streaming(),
            buffer_truncated: self.is_buffer_truncated(),
        }
    }

    /// Emit the status line and headers. Only the first call takes effect;
    /// later calls (and later statuses) are ignored.
    pub async fn write_header(&mut self, status: StatusCode) {
        if self.headers_written {
            return;
        }
        self.status = Some(status);

        self.should_buffer = self.options.enable_buffering && should_buffer(&self.headers);

        if self.options.max_response_body_bytes > 0 {
            if let Some(len) = content_length(&self.headers) {
                if len > self.options.max_response_body_bytes {
                    self.send_limit_error().await;
                    return;
                }
            }
        }

        self.flush_head().await;
    }

    /// Forward body bytes, capturing a copy while buffering is active.
    /// Always reports the full input length so a misbehaving upstream is
    /// drained rather than surfaced as a write error.
    pub async fn write(&mut self, buf: &[u8]) -> usize {
        if !self.headers_written {
            let status = self.status.unwrap_or(StatusCode::OK);
            self.write_header(status).await;
        }
        if self.limit_hit {
            // Past the standalone cap: swallow the rest of the body.
            return buf.len();
        }

        let mut accepted: &[u8] = buf;
        let limit = self.options.max_response_body_bytes;
        if limit > 0 && self.bytes_written + buf.len() as u64 > limit {
            let room = limit.saturating_sub(self.bytes_written) as usize;
            accepted = &buf[..room];
            self.limit_hit = true;
        }

        if !accepted.is_empty() {
            self.capture_chunk(accepted);
            self.forward(accepted).await;
        }
        buf.len()
    }

    /// Flush any staged bytes. Writes are forwarded eagerly, so this only
    /// matters for targets that batch.
    pub async fn flush(&mut self) {
        if !self.scratch.is_empty() {
            let chunk = self.scratch.split().freeze();
            if self.target.send_data(chunk).await.is_err() {
                self.target_failed = true;
            }
        }
    }

    pub fn hijack(&mut self) -> Result<Box<dyn RawStream>, SinkError> {
        self.target.hijack()
    }

    pub fn push(&mut self, path: &str) -> Result<(), SinkError> {
        self.target.push(path)
    }

    /// Tear the client connection without completing the body.
    pub async fn abort(&mut self) {
        self.target.abort().await;
        self.target_failed = true;
    }

    /// Replace the in-progress response with the standalone 413. Used only
    /// when the sink itself owns the body cap.
    async fn send_limit_error(&mut self) {
        if self.error_body_written || self.headers_written {
            return;
        }
        self.error_body_written = true;
        self.limit_hit = true;

        let body = "response body size exceeds limit";
        self.headers.clear();
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        self.headers
            .insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        if let Ok(value) = HeaderValue::from_str(&self.options.max_response_body_bytes.to_string()) {
            self.headers.insert("x-response-limit-exceeded", value);
        }
        self.headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.status = Some(StatusCode::PAYLOAD_TOO_LARGE);
        self.should_buffer = false;
        self.flush_head().await;
        self.forward(body.as_bytes()).await;
    }

    async fn flush_head(&mut self) {
        self.headers_written = true;
        let head = ResponseHead {
            status: self.status.unwrap_or(StatusCode::OK),
            headers: self.headers.clone(),
        };
        if self.target.send_head(head).await.is_err() {
            self.target_failed = true;
        }
    }

    fn capture_chunk(&mut self, chunk: &[u8]) {
        if !self.should_buffer || self.streaming {
            return;
        }
        if self.capture.length() + chunk.len() > STREAMING_THRESHOLD {
            // Permanently stop capturing; the body keeps flowing through.
            self.streaming = true;
            self.buffer_truncated = self.capture.length() > 0;
            return;
        }
        self.capture.write(chunk);
    }

    async fn forward(&mut self, chunk: &[u8]) {
        if self.target_failed {
            return;
        }
        // Stage through the pooled scratch so the chunk handed to the
        // channel reuses its allocation where the receiver keeps up.
        self.scratch.extend_from_slice(chunk);
        let data = self.scratch.split().freeze();
        let len = data.len() as u64;
        match self.target.send_data(data).await {
            Ok(()) => self.bytes_written += len,
            Err(_) => self.target_failed = true,
        }
        self.scratch.reserve(crate::proxy::buffer_pool::SCRATCH_BUFFER_SIZE);
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        let scratch = std::mem::take(&mut self.scratch);
        self.pool.put(scratch);
    }
}

/// Decide whether a response body is worth capturing, from its headers.
fn should_buffer(headers: &HeaderMap) -> bool {
    if let Some(te) = headers.get(header::TRANSFER_ENCODING) {
        if te
            .to_str()
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
        {
            return false;
        }
    }

    if let Some(len) = content_length(headers) {
        if len > STREAMING_THRESHOLD as u64 {
            return false;
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    const TEXTUAL_PREFIXES: &[&str] = &["application/json", "application/xml", "text/"];
    const BINARY_PREFIXES: &[&str] = &[
        "image/",
        "video/",
        "audio/",
        "application/octet-stream",
        "application/pdf",
        "application/zip",
    ];

    if content_type.is_empty() || TEXTUAL_PREFIXES.iter().any(|p| content_type.starts_with(p)) {
        return true;
    }
    if BINARY_PREFIXES.iter().any(|p| content_type.starts_with(p)) {
        return false;
    }
    ["text", "json", "xml"].iter().any(|s| content_type.contains(s))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Production target: hands the head to the waiting request handler and
/// streams body chunks into the response body channel.
pub struct ChannelTarget {
    head_tx: Option<tokio::sync::oneshot::Sender<ResponseHead>>,
    body_tx: tokio::sync::mpsc::Sender<io::Result<Bytes>>,
}

impl ChannelTarget {
    pub fn new(
        head_tx: tokio::sync::oneshot::Sender<ResponseHead>,
        body_tx: tokio::sync::mpsc::Sender<io::Result<Bytes>>,
    ) -> Self {
        Self {
            head_tx: Some(head_tx),
            body_tx,
        }
    }
}

#[async_trait]
impl ResponseTarget for ChannelTarget {
    async fn send_head(&mut self, mut head: ResponseHead) -> io::Result<()> {
        // Framing is owned by the server side of this hop; a forwarded
        // Transfer-Encoding would conflict with it.
        head.headers.remove(header::TRANSFER_ENCODING);
        self.head_tx
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "head already sent"))?
            .send(head)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client handler gone"))
    }

    async fn send_data(&mut self, data: Bytes) -> io::Result<()> {
        self.body_tx
            .send(Ok(data))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
    }

    async fn abort(&mut self) {
        let _ = self
            .body_tx
            .send(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "response aborted")))
            .await;
    }
}
