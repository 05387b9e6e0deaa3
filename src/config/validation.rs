//! Configuration validation logic.

use crate::config::schema::GatewayConfig;
use url::Url;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a GatewayConfig for semantic correctness.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // 1. Listener port must be a port number
    if config.listen_port.parse::<u16>().is_err() {
        errors.push(ValidationError(format!(
            "listen_port '{}' is not a valid port",
            config.listen_port
        )));
    }

    // 2. Response caps cannot be negative
    if config.response_limits.max_response_body_size < 0 {
        errors.push(ValidationError(
            "response_limits.max_response_body_size must be >= 0".to_string(),
        ));
    }

    // 3. Routes: pattern present, target parseable with scheme and host,
    //    per-route cap non-negative
    for (i, route) in config.routes.iter().enumerate() {
        if route.path.is_empty() {
            errors.push(ValidationError(format!("route[{}] is missing a path pattern", i)));
        }

        match Url::parse(&route.target_url) {
            Ok(url) => {
                if url.scheme().is_empty() || url.host_str().is_none() {
                    errors.push(ValidationError(format!(
                        "route[{}] target_url '{}' must have a scheme and host",
                        i, route.target_url
                    )));
                }
            }
            Err(e) => {
                errors.push(ValidationError(format!(
                    "route[{}] target_url '{}' is invalid: {}",
                    i, route.target_url, e
                )));
            }
        }

        if route.max_response_body_size < 0 {
            errors.push(ValidationError(format!(
                "route[{}] max_response_body_size must be >= 0",
                i
            )));
        }
    }

    // 4. Plugin trust settings come as a complete triple or not at all
    let plugins = &config.plugins;
    let fields_set = [
        !plugins.directory.is_empty(),
        !plugins.public_key_path.is_empty(),
        !plugins.public_key_hash.is_empty(),
    ];
    if fields_set.iter().any(|&set| set) && !fields_set.iter().all(|&set| set) {
        errors.push(ValidationError(
            "plugins.directory, public_key_path and public_key_hash must all be set together"
                .to_string(),
        ));
    }

    if config.request_timeout_secs == 0 {
        tracing::debug!("request_timeout_secs is 0, using the built-in default");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::*;

    fn base_config() -> GatewayConfig {
        GatewayConfig {
            listen_port: "8080".into(),
            routes: vec![RouteConfig {
                path: "^/api".into(),
                target_url: "http://127.0.0.1:3000".into(),
                ..RouteConfig::default()
            }],
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn test_negative_body_cap_rejected() {
        let mut config = base_config();
        config.routes[0].max_response_body_size = -1;
        let errs = validate_config(&config).unwrap_err();
        assert!(errs.iter().any(|e| e.0.contains("max_response_body_size")));
    }

    #[test]
    fn test_negative_global_cap_rejected() {
        let mut config = base_config();
        config.response_limits.max_response_body_size = -5;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_target_without_host_rejected() {
        let mut config = base_config();
        config.routes[0].target_url = "not a url".into();
        let errs = validate_config(&config).unwrap_err();
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn test_partial_plugin_triple_rejected() {
        let mut config = base_config();
        config.plugins.directory = "/opt/plugins".into();
        let errs = validate_config(&config).unwrap_err();
        assert!(errs[0].0.contains("all be set together"));

        config.plugins.public_key_path = "/opt/plugins/key.pub".into();
        config.plugins.public_key_hash = "ab12".into();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_bad_port_rejected() {
        let mut config = base_config();
        config.listen_port = "http".into();
        assert!(validate_config(&config).is_err());
    }
}
