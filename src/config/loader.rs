//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use regex::Regex;
use url::Url;

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
    Validation(Vec<ValidationError>),
    Pattern { pattern: String, source: regex::Error },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
            ConfigError::Pattern { pattern, source } => {
                write!(f, "Invalid route pattern '{}': {}", pattern, source)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A route whose pattern and target survived compilation. Published
/// snapshots only ever contain compiled routes.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub config: crate::config::schema::RouteConfig,
    pub pattern: Regex,
    pub target: Url,
}

impl CompiledRoute {
    /// Strip the portion of `path` matched by this route's pattern,
    /// returning the remainder. Patterns that match mid-path leave the
    /// path untouched.
    pub fn strip_matched_prefix<'a>(&self, path: &'a str) -> &'a str {
        match self.pattern.find(path) {
            Some(m) if m.start() == 0 => &path[m.end()..],
            _ => path,
        }
    }
}

/// The unit of atomic reload: a validated config plus its compiled route
/// table. Immutable once published.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub config: GatewayConfig,
    pub routes: Vec<CompiledRoute>,
    /// Raw file contents, kept for change detection on reload.
    pub raw: String,
}

/// Load, validate, and compile configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<Snapshot, ConfigError> {
    let raw = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&raw)
}

/// Parse and compile configuration from raw YAML.
pub fn parse_config(raw: &str) -> Result<Snapshot, ConfigError> {
    let mut config: GatewayConfig = serde_yaml::from_str(raw).map_err(ConfigError::Parse)?;

    if config.metrics.enabled && config.metrics.path.is_empty() {
        config.metrics.path = "/metrics".to_string();
    }

    validate_config(&config).map_err(ConfigError::Validation)?;

    let mut routes = Vec::with_capacity(config.routes.len());
    for route in &config.routes {
        let pattern = Regex::new(&route.path).map_err(|source| ConfigError::Pattern {
            pattern: route.path.clone(),
            source,
        })?;
        // Validation already proved the URL parses with scheme and host.
        let target = Url::parse(&route.target_url).map_err(|_| ConfigError::Validation(vec![
            ValidationError(format!("target_url '{}' is invalid", route.target_url)),
        ]))?;
        routes.push(CompiledRoute {
            config: route.clone(),
            pattern,
            target,
        });
    }

    Ok(Snapshot {
        config,
        routes,
        raw: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
listen_port: "8080"
hot_reload: true
request_timeout_secs: 10
response_limits:
  max_response_body_size: 1048576
metrics:
  enabled: true
transport:
  http:
    idle_conn_timeout_secs: 60
    max_idle_conns_per_host: 4
locations:
  - path: "^/api/"
    target_url: "http://127.0.0.1:9000/backend"
    max_response_body_size: 2048
    middlewares: ["auth"]
  - path: "^/media/"
    target_url: "http://127.0.0.1:9001"
    disable_response_buffering: true
"#;

    #[test]
    fn parses_and_compiles_sample() {
        let snapshot = parse_config(SAMPLE).unwrap();
        assert_eq!(snapshot.config.listen_port, "8080");
        assert_eq!(snapshot.routes.len(), 2);
        assert!(snapshot.routes[0].pattern.is_match("/api/users"));
        assert_eq!(snapshot.routes[0].target.host_str(), Some("127.0.0.1"));
        assert_eq!(snapshot.config.metrics.path, "/metrics");
        assert_eq!(snapshot.config.request_timeout().as_secs(), 10);
    }

    #[test]
    fn locations_alias_maps_to_routes() {
        let snapshot = parse_config(SAMPLE).unwrap();
        assert_eq!(snapshot.config.routes.len(), 2);
        assert!(snapshot.config.routes[1].disable_response_buffering);
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let raw = "listen_port: \"8080\"\nfuture_feature: true\n";
        assert!(parse_config(raw).is_ok());
    }

    #[test]
    fn bad_pattern_is_a_load_error() {
        let raw = r#"
listen_port: "8080"
locations:
  - path: "([unclosed"
    target_url: "http://127.0.0.1:9000"
"#;
        let err = parse_config(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Pattern { .. }));
    }

    #[test]
    fn negative_cap_is_a_load_error() {
        let raw = r#"
listen_port: "8080"
locations:
  - path: "^/x"
    target_url: "http://127.0.0.1:9000"
    max_response_body_size: -1
"#;
        assert!(matches!(
            parse_config(raw).unwrap_err(),
            ConfigError::Validation(_)
        ));
    }

    #[test]
    fn strip_matched_prefix_uses_the_match() {
        let snapshot = parse_config(SAMPLE).unwrap();
        let route = &snapshot.routes[0];
        assert_eq!(route.strip_matched_prefix("/api/users/7"), "users/7");
        assert_eq!(route.strip_matched_prefix("/other"), "/other");
    }
}
