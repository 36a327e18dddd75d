//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ports valid)
//! - Check that every `host:port` in the file parses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;
use crate::routing::destination::Destination;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address '{value}'")]
    InvalidAddress { field: &'static str, value: String },
    #[error("{field}: invalid host:port '{value}'")]
    InvalidTarget { field: String, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("routes[{0}]: set either path or path_prefix, not both")]
    AmbiguousPath(usize),
    #[error("routes[{index}]: {field} must start with '/'")]
    RelativePath { index: usize, field: &'static str },
    #[error("listener.tls: cert_path and key_path are required")]
    IncompleteTls,
    #[error("connect.allowed_ports: port 0 is not valid")]
    PortZero,
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero("listener.max_connections"));
    }
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.trim().is_empty() || tls.key_path.trim().is_empty() {
            errors.push(ValidationError::IncompleteTls);
        }
    }

    let timeouts = &config.timeouts;
    for (name, value) in [
        ("timeouts.connect_secs", timeouts.connect_secs),
        ("timeouts.idle_secs", timeouts.idle_secs),
        ("timeouts.chunk_wait_ms", timeouts.chunk_wait_ms),
        ("timeouts.write_secs", timeouts.write_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::Zero(name));
        }
    }

    for (i, upstream) in config.chain.upstreams.iter().enumerate() {
        check_target(&mut errors, format!("chain.upstreams[{}]", i), upstream);
    }
    if config.connect.allowed_ports.contains(&0) {
        errors.push(ValidationError::PortZero);
    }
    if let Some(target) = &config.proxy.default_target {
        check_target(&mut errors, "proxy.default_target".to_string(), target);
    }

    for (i, route) in config.routes.iter().enumerate() {
        check_target(&mut errors, format!("routes[{}].target", i), &route.target);
        if route.path.is_some() && route.path_prefix.is_some() {
            errors.push(ValidationError::AmbiguousPath(i));
        }
        for (field, value) in [("path", &route.path), ("path_prefix", &route.path_prefix)] {
            if matches!(value, Some(p) if !p.starts_with('/')) {
                errors.push(ValidationError::RelativePath { index: i, field });
            }
        }
    }

    if config.observability.metrics_enabled {
        check_address(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }
    if config.admin.enabled {
        check_address(&mut errors, "admin.address", &config.admin.address);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

fn check_target(errors: &mut Vec<ValidationError>, field: String, value: &str) {
    if Destination::parse(value).is_none() {
        errors.push(ValidationError::InvalidTarget {
            field,
            value: value.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RouteConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn collects_all_errors() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.timeouts.idle_secs = 0;
        config.chain.upstreams = vec!["proxy:3128".into(), "proxy:notaport".into()];
        config.routes.push(RouteConfig {
            path: Some("one".into()),
            path_prefix: Some("/".into()),
            target: "localhost:8080".into(),
            ..RouteConfig::default()
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors.contains(&ValidationError::Zero("timeouts.idle_secs")));
        assert!(errors.contains(&ValidationError::AmbiguousPath(0)));
    }
}
