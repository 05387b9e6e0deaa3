//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default per-request timeout applied when the config leaves it at 0.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Port the listener binds on (e.g. "8080").
    pub listen_port: String,

    /// Reload the configuration when the file changes on disk.
    pub hot_reload: bool,

    /// Total time budget for one proxied exchange; 0 means the default.
    pub request_timeout_secs: u64,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Global response-size policy.
    pub response_limits: ResponseLimits,

    /// Metrics exposition settings.
    pub metrics: MetricsConfig,

    /// Signed middleware plugin settings.
    pub plugins: PluginsConfig,

    /// Default upstream transport settings.
    pub transport: TransportConfig,

    /// Ordered route table; first pattern match wins.
    #[serde(alias = "locations")]
    pub routes: Vec<RouteConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Global response-size limits.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ResponseLimits {
    /// Default cap on upstream response bodies in bytes; 0 = unlimited.
    /// Negative values are rejected at load.
    pub max_response_body_size: i64,
}

/// Metrics exposition settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,

    /// Absolute path served by the gateway; defaults to "/metrics".
    pub path: String,
}

/// Signed plugin settings. Either all three fields are set or all are
/// empty; partial configuration is rejected at load.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory scanned for `<name>/<name>.bin` plugin layouts.
    pub directory: String,

    /// Path to the raw Ed25519 public key file.
    pub public_key_path: String,

    /// Hex SHA-256 of the public key file, pinning its integrity.
    pub public_key_hash: String,
}

impl PluginsConfig {
    pub fn is_configured(&self) -> bool {
        !self.directory.is_empty()
    }
}

/// Upstream transport settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    pub http: HttpTransportConfig,
}

/// HTTP transport tuning for upstream connections. These settings are the
/// identity of a built transport: routes sharing an identical effective
/// config share one connection pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    /// How long an idle pooled connection is kept before closing.
    pub idle_conn_timeout_secs: u64,

    /// Cap on idle connections across all hosts.
    pub max_idle_conns: usize,

    /// Cap on idle connections kept per host.
    pub max_idle_conns_per_host: usize,

    /// Cap on total connections per host; 0 = unlimited.
    pub max_conns_per_host: usize,

    /// TLS handshake budget.
    pub tls_handshake_timeout_secs: u64,

    /// Time to wait for upstream response headers; 0 = unlimited.
    pub response_header_timeout_secs: u64,

    /// Wait after `Expect: 100-continue` before sending the body.
    pub expect_continue_timeout_secs: u64,

    /// Connection establishment budget.
    pub dial_timeout_secs: u64,

    /// TCP keep-alive probe interval.
    pub keep_alive_secs: u64,

    /// Skip advertising compression support to upstreams.
    pub disable_compression: bool,

    /// Speak HTTP/2 to the upstream exclusively.
    pub force_http2: bool,

    /// Client certificate for upstream mTLS (PEM).
    pub cert_file: String,

    /// Client private key for upstream mTLS (PEM).
    pub key_file: String,

    /// CA bundle used to verify upstreams (PEM); empty = system roots.
    pub ca_file: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            idle_conn_timeout_secs: 90,
            max_idle_conns: 100,
            max_idle_conns_per_host: 10,
            max_conns_per_host: 0,
            tls_handshake_timeout_secs: 10,
            response_header_timeout_secs: 0,
            expect_continue_timeout_secs: 1,
            dial_timeout_secs: 10,
            keep_alive_secs: 30,
            disable_compression: false,
            force_http2: false,
            cert_file: String::new(),
            key_file: String::new(),
            ca_file: String::new(),
        }
    }
}

/// One route: a path pattern mapped to an upstream target plus policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Regular expression matched against the request path.
    pub path: String,

    /// Absolute URL of the upstream; must carry scheme and host.
    pub target_url: String,

    /// Forward the target's path verbatim instead of appending the
    /// matched remainder.
    pub replace_path: bool,

    /// Allow WebSocket upgrades on this route.
    pub enable_websocket: bool,

    /// Headers set on the forwarded request. `Host` overrides the
    /// forwarded Host header.
    pub additional_headers: HashMap<String, String>,

    /// Headers removed from the forwarded request.
    pub excluded_headers: Vec<String>,

    /// Plugin middleware names, applied innermost-last.
    pub middlewares: Vec<String>,

    /// Per-route response body cap; 0 inherits the global default,
    /// negative is rejected at load.
    pub max_response_body_size: i64,

    /// Turn off response body capturing for this route.
    pub disable_response_buffering: bool,

    /// Optional transport settings replacing the defaults wholesale.
    pub transport: Option<TransportConfig>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            target_url: String::new(),
            replace_path: false,
            enable_websocket: false,
            additional_headers: HashMap::new(),
            excluded_headers: Vec::new(),
            middlewares: Vec::new(),
            max_response_body_size: 0,
            disable_response_buffering: false,
            transport: None,
        }
    }
}

impl RouteConfig {
    /// Effective response body cap for this route: the route-level setting
    /// is authoritative when positive, otherwise the global default is
    /// inherited. 0 means unlimited.
    pub fn effective_max_response_body_size(&self, global: i64) -> u64 {
        if self.max_response_body_size > 0 {
            self.max_response_body_size as u64
        } else if global > 0 {
            global as u64
        } else {
            0
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        let secs = if self.request_timeout_secs > 0 {
            self.request_timeout_secs
        } else {
            DEFAULT_REQUEST_TIMEOUT_SECS
        };
        std::time::Duration::from_secs(secs)
    }
}
