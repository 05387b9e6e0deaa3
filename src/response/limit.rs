//! Per-route response body size enforcement.
//!
//! Sits between the proxy engine and the sink when a route carries a body
//! cap. Writes are held back until either the response is known to fit the
//! pre-flush window or the cap is breached; a breach before headers reach
//! the client replaces the whole response with a single JSON 413.
//!
//! State machine: `Open` → (`Content-Length` over cap) `Rejected`
//!                        | (first write) `Buffering`
//!                        | (window filled) `PassThrough`
//! `Buffering` → (cumulative bytes over cap) `Rejected`
//! `PassThrough` → (cumulative bytes over cap) overflow signalled upstream

use http::header::{self, HeaderValue};
use http::StatusCode;

use crate::response::buffer::{BufferStatus, LimitedBuffer};
use crate::response::error_body;
use crate::response::sink::{ResponseSink, STREAMING_THRESHOLD};

/// Raised to the relay loop when the cap is breached and the response can
/// no longer be corrected in place.
#[derive(Debug, thiserror::Error)]
#[error("response body size exceeds limit of {limit} bytes")]
pub struct LimitExceeded {
    pub limit: u64,
    /// True when the 413 replacement was emitted; false when headers were
    /// already on the wire and the connection must be torn instead.
    pub rejected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Buffering,
    PassThrough,
    Rejected,
}

pub struct LimitInterceptor {
    sink: ResponseSink,
    limit: u64,
    path: String,
    written: u64,
    status: StatusCode,
    buffer: LimitedBuffer,
    state: State,
    limit_rejected: bool,
}

impl LimitInterceptor {
    pub fn new(sink: ResponseSink, limit: u64, path: impl Into<String>) -> Self {
        // The pre-flush window never needs to exceed the cap itself, and is
        // bounded so an adversarial upstream cannot pin memory.
        let window = limit.min(STREAMING_THRESHOLD as u64) as usize;
        Self {
            sink,
            limit,
            path: path.into(),
            written: 0,
            status: StatusCode::OK,
            buffer: LimitedBuffer::new(window),
            state: State::Open,
            limit_rejected: false,
        }
    }

    pub fn sink(&self) -> &ResponseSink {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut ResponseSink {
        &mut self.sink
    }

    pub fn into_sink(self) -> ResponseSink {
        self.sink
    }

    /// True once the 413 replacement has been committed.
    pub fn rejected(&self) -> bool {
        self.limit_rejected
    }

    /// True once the original (non-413) headers are on the wire.
    pub fn headers_committed(&self) -> bool {
        self.state == State::PassThrough
    }

    /// Record the upstream status and screen the declared length.
    pub async fn write_header(&mut self, status: StatusCode) {
        if self.state != State::Open {
            return;
        }
        self.status = status;
        if self.declared_length_over_limit() {
            self.reject().await;
        } else {
            self.state = State::Buffering;
        }
    }

    /// Accept a body chunk. Returns the chunk length, or `LimitExceeded`
    /// once the cap is breached.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, LimitExceeded> {
        match self.state {
            State::Open => {
                // Body before an explicit header: same screening applies.
                self.write_header(StatusCode::OK).await;
                if self.state == State::Rejected {
                    return Err(self.exceeded(true));
                }
                Box::pin(self.write(buf)).await
            }
            State::Rejected => Err(self.exceeded(true)),
            State::Buffering => {
                if self.written + buf.len() as u64 > self.limit {
                    self.reject().await;
                    return Err(self.exceeded(true));
                }
                self.written += buf.len() as u64;
                let (accepted, status) = self.buffer.write(buf);
                if status == BufferStatus::Full {
                    // Window filled: commit headers and stream from now on,
                    // starting with whatever part of this chunk did not fit.
                    self.commit(None).await;
                    if accepted < buf.len() {
                        self.sink.write(&buf[accepted..]).await;
                    }
                }
                Ok(buf.len())
            }
            State::PassThrough => {
                if self.written + buf.len() as u64 > self.limit {
                    // Too late to replace the response; deliver exactly up
                    // to the cap and let the relay tear the connection.
                    let room = (self.limit - self.written) as usize;
                    if room > 0 {
                        self.sink.write(&buf[..room]).await;
                        self.written = self.limit;
                    }
                    return Err(self.exceeded(false));
                }
                self.written += buf.len() as u64;
                self.sink.write(buf).await;
                Ok(buf.len())
            }
        }
    }

    /// Push anything still buffered to the sink. For a response that fit
    /// entirely in the window this stamps an exact `Content-Length` so a
    /// small buffered body is never chunked.
    pub async fn flush(&mut self) {
        match self.state {
            State::Buffering | State::Open => {
                let len = self.buffer.length();
                self.commit(Some(len)).await;
            }
            State::PassThrough => self.sink.flush().await,
            State::Rejected => {}
        }
    }

    async fn commit(&mut self, content_length: Option<usize>) {
        if let Some(len) = content_length {
            self.sink
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        self.sink.write_header(self.status).await;
        let buffered = self.buffer.snapshot_bytes();
        self.buffer.reset();
        if !buffered.is_empty() {
            self.sink.write(&buffered).await;
        }
        self.state = State::PassThrough;
    }

    /// Discard anything buffered and emit a different response instead.
    /// A no-op once the original headers (or a 413) are on the wire.
    pub async fn replace_response(
        &mut self,
        status: StatusCode,
        headers: http::HeaderMap,
        body: &[u8],
    ) {
        if matches!(self.state, State::Rejected | State::PassThrough) {
            return;
        }
        self.state = State::Rejected;
        self.buffer.reset();

        let sink_headers = self.sink.headers_mut();
        sink_headers.clear();
        sink_headers.extend(headers);

        self.sink.write_header(status).await;
        self.sink.write(body).await;
        self.sink.flush().await;
    }

    async fn reject(&mut self) {
        tracing::warn!(
            path = %self.path,
            limit_bytes = self.limit,
            "Response body size limit exceeded"
        );

        let body = error_body::limit_exceeded_body(self.limit, &self.path);
        let headers = error_body::limit_exceeded_headers(body.len());
        self.replace_response(StatusCode::PAYLOAD_TOO_LARGE, headers, body.as_bytes())
            .await;
        self.limit_rejected = true;
    }

    fn declared_length_over_limit(&self) -> bool {
        self.sink
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|len| len > self.limit)
            .unwrap_or(false)
    }

    fn exceeded(&self, rejected: bool) -> LimitExceeded {
        LimitExceeded {
            limit: self.limit,
            rejected,
        }
    }
}
