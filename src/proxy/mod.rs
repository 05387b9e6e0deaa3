//! Proxy subsystem: the per-route engine and its supporting pieces.
//!
//! # Data Flow
//! ```text
//! Matched route + request
//!     → engine.rs (director rewrite → upstream dispatch → response relay)
//!     → response pipeline (limit interceptor → sink → client channel)
//! ```

pub mod buffer_pool;
pub mod engine;

pub use buffer_pool::BufferPool;
pub use engine::ProxyEngine;

use axum::body::Body;
use axum::response::Response;
use futures_util::future::BoxFuture;
use http::Request;
use std::sync::Arc;

/// A request handler in the middleware chain. Plugins wrap these; the
/// innermost handler is the proxy engine itself.
pub trait Handler: Send + Sync {
    fn call(&self, req: Request<Body>) -> BoxFuture<'static, Response>;
}

pub type SharedHandler = Arc<dyn Handler>;

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F>(pub F);

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Response> + Send + 'static,
{
    fn call(&self, req: Request<Body>) -> BoxFuture<'static, Response> {
        Box::pin((self.0)(req))
    }
}
