//! Observability subsystem.
//!
//! # Responsibilities
//! - Initialize structured logging (tracing + EnvFilter)
//! - Define the metrics-recording seam the data plane depends on
//! - Provide the Prometheus-backed recorder used in production
//!
//! # Design Decisions
//! - The proxy core only talks to `MetricsRecorder`; the exporter is an
//!   injected collaborator, swappable in tests

pub mod logging;
pub mod metrics;

pub use metrics::{MetricsRecorder, NullRecorder, PrometheusMetrics};
