//! Upstream transport subsystem.
//!
//! # Data Flow
//! ```text
//! Route (transport override?) + snapshot defaults
//!     → upstream.rs (resolve effective config, forwarded headers)
//!     → cache.rs (fingerprint → built client, insert-or-reuse)
//!     → hyper client round trip
//! ```
//!
//! # Design Decisions
//! - Transports are identified by a digest of their effective settings, so
//!   a reload that leaves a route's transport untouched reuses its pool
//! - Entries are immutable once published; invalidation drops them wholesale

pub mod cache;
pub mod upstream;

pub use cache::{TransportCache, TransportError, UpstreamClient};
pub use upstream::{UpstreamError, UpstreamTransport};
