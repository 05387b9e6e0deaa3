//! Portico: a Layer-7 reverse-proxy data plane.
//!
//! # Architecture Overview
//!
//! ```text
//!                ┌──────────────────────────────────────────────────────┐
//!                │                      GATEWAY                          │
//!                │                                                       │
//!  Client ───────┼─▶ server ──▶ router ──▶ middleware chain              │
//!                │   (context)   (match)    (signed plugins)             │
//!                │                             │                         │
//!                │                             ▼                         │
//!                │                        proxy engine                   │
//!                │                   director → transport                │
//!                │                             │                         │
//!                │                             ▼                         │
//!  Client ◀──────┼── response ◀── sink ◀── limit interceptor ◀── relay ──┼── Upstream
//!                │   (stream)    (capture)   (per-route cap)             │
//!                │                                                       │
//!                │   config (snapshot store, hot reload) ── transport    │
//!                │   observability (tracing, metrics seam)    cache      │
//!                └──────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod context;
pub mod proxy;
pub mod response;
pub mod router;
pub mod server;
pub mod transport;

// Extensibility
pub mod plugin;
pub mod websocket;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::{ConfigStore, GatewayConfig, Snapshot};
pub use router::AppState;
pub use server::Server;
