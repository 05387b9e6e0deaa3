//! Per-route middleware chain construction.
//!
//! Traverses the route's middleware list in reverse so the first
//! configured name ends up outermost: `[m1, m2, m3]` runs as
//! `m1 → m2 → m3 → engine`.

use std::sync::Arc;

use axum::body::Body;
use http::{Request, StatusCode};
use serde_json::json;

use crate::config::loader::CompiledRoute;
use crate::context::RequestContext;
use crate::plugin::PluginRegistry;
use crate::proxy::{HandlerFn, SharedHandler};
use crate::response::error_body;

/// Middlewares that must be present for a route that names them; their
/// absence blocks the route instead of silently weakening it.
pub const CRITICAL_MIDDLEWARES: &[&str] = &["auth", "security"];

/// Wrap `handler` with the route's configured middlewares. Unknown names
/// are logged and skipped unless critical, in which case the whole route
/// is replaced with a constant 500 responder.
pub fn build_chain(
    route: &CompiledRoute,
    registry: &PluginRegistry,
    handler: SharedHandler,
) -> SharedHandler {
    let mut missing_critical: Vec<String> = Vec::new();
    let mut handler = handler;

    for name in route.config.middlewares.iter().rev() {
        let mut applied = false;
        if let Some(plugin) = registry.lookup(name) {
            if let Some(middleware) = plugin.middleware() {
                handler = middleware.wrap(handler);
                applied = true;
            }
        }
        if !applied {
            if CRITICAL_MIDDLEWARES.contains(&name.as_str()) {
                missing_critical.push(name.clone());
            }
            tracing::warn!(middleware = %name, "Middleware not found");
        }
    }

    if !missing_critical.is_empty() {
        missing_critical.reverse();
        return blocking_handler(missing_critical);
    }

    handler
}

/// Constant responder for routes whose critical middleware is absent.
fn blocking_handler(missing: Vec<String>) -> SharedHandler {
    Arc::new(HandlerFn(move |req: Request<Body>| {
        let missing = missing.clone();
        async move {
            let request_id = req
                .extensions()
                .get::<RequestContext>()
                .map(|ctx| ctx.request_id.clone());
            error_body::error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Service configuration error",
                Some(json!({ "missing_components": missing })),
                request_id.as_deref(),
            )
        }
    }))
}
