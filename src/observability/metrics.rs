//! Metrics recording seam and the Prometheus-backed implementation.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use regex::Regex;
use std::sync::OnceLock;

/// Counters the data plane records. The proxy core depends only on this
/// trait, never on a specific metrics backend.
pub trait MetricsRecorder: Send + Sync {
    fn record_request(&self, method: &str, path: &str, status: u16, duration: Duration);
    fn record_bytes(&self, direction: &str, bytes: u64);
    fn record_error(&self, kind: &str);
    fn record_limit_exceeded(&self, path: &str);
    fn update_active(&self, delta: i64);
}

/// Recorder that drops everything. Used in tests and when metrics are
/// disabled.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl MetricsRecorder for NullRecorder {
    fn record_request(&self, _: &str, _: &str, _: u16, _: Duration) {}
    fn record_bytes(&self, _: &str, _: u64) {}
    fn record_error(&self, _: &str) {}
    fn record_limit_exceeded(&self, _: &str) {}
    fn update_active(&self, _: i64) {}
}

/// Prometheus-backed recorder. Exposition text is rendered on demand by
/// the router's metrics endpoint.
pub struct PrometheusMetrics {
    handle: PrometheusHandle,
}

impl PrometheusMetrics {
    /// Install the global recorder. Fails if one is already installed.
    pub fn install() -> Result<Self, metrics_exporter_prometheus::BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        Ok(Self { handle })
    }

    pub fn handle(&self) -> PrometheusHandle {
        self.handle.clone()
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl MetricsRecorder for PrometheusMetrics {
    fn record_request(&self, method: &str, path: &str, status: u16, duration: Duration) {
        let labels = [
            ("method", method.to_string()),
            ("normalized_path", normalize_path(path)),
            ("status_code", status.to_string()),
        ];
        counter!("http_requests_total", &labels).increment(1);
        histogram!("http_request_duration_seconds", &labels).record(duration.as_secs_f64());
    }

    fn record_bytes(&self, direction: &str, bytes: u64) {
        counter!("data_transferred_bytes_total", "direction" => direction.to_string())
            .increment(bytes);
    }

    fn record_error(&self, kind: &str) {
        counter!("proxy_errors_total", "kind" => kind.to_string()).increment(1);
    }

    fn record_limit_exceeded(&self, path: &str) {
        counter!("response_limit_exceeded_total", "normalized_path" => normalize_path(path))
            .increment(1);
    }

    fn update_active(&self, delta: i64) {
        if delta >= 0 {
            gauge!("active_connections").increment(delta as f64);
        } else {
            gauge!("active_connections").decrement((-delta) as f64);
        }
    }
}

/// Collapse numeric path segments so label cardinality stays bounded
/// ("/users/123" -> "/users/:id").
pub fn normalize_path(path: &str) -> String {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    let digits = DIGITS.get_or_init(|| Regex::new(r"\d+").expect("static pattern compiles"));
    digits.replace_all(path, ":id").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_numbers() {
        assert_eq!(normalize_path("/users/123"), "/users/:id");
        assert_eq!(normalize_path("/v2/items/9/detail"), "/v:id/items/:id/detail");
        assert_eq!(normalize_path("/static/app.css"), "/static/app.css");
    }
}
