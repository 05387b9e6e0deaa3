//! Response pipeline: capture buffer, client-facing sink, size enforcement.
//!
//! # Data Flow
//! ```text
//! Upstream body frames
//!     → limit.rs (optional per-route cap; 413 replacement before commit)
//!     → sink.rs (status once-guard, capture/streaming decision, counters)
//!     → ResponseTarget (channel feeding the client's streaming body)
//! ```
//!
//! # Design Decisions
//! - The interceptor defers header emission; the sink never does
//! - Error payload shapes live in one place so Content-Length stays exact

pub mod buffer;
pub mod error_body;
pub mod limit;
pub mod sink;

pub use buffer::{BufferStatus, LimitedBuffer};
pub use limit::{LimitExceeded, LimitInterceptor};
pub use sink::{ChannelTarget, ResponseSink, ResponseTarget, SinkMetrics, SinkOptions};
