//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, slot counts, port ranges)
//! - Check the parent proxy and metrics address are usable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: UpstreamConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::UpstreamConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &UpstreamConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Some(host) = &config.parent.host {
        if host.trim().is_empty() {
            errors.push(ValidationError::new("parent.host", "must not be empty"));
        }
        if config.parent.port == 0 {
            errors.push(ValidationError::new("parent.port", "must be non-zero"));
        }
    }

    if config.pool.server_max_slots > 64 {
        errors.push(ValidationError::new(
            "pool.server_max_slots",
            "must be at most 64",
        ));
    }
    if config.pool.broken_origin_threshold < 1 {
        errors.push(ValidationError::new(
            "pool.broken_origin_threshold",
            "must be at least 1",
        ));
    }
    if config.pool.server_expire_secs == 0 {
        errors.push(ValidationError::new(
            "pool.server_expire_secs",
            "must be greater than 0",
        ));
    }

    if config.pipeline.pmm_first_size > 0 && config.pipeline.pmm_size == 0 {
        errors.push(ValidationError::new(
            "pipeline.pmm_first_size",
            "requires pipeline.pmm_size",
        ));
    }

    for (field, value) in [
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.read_secs", config.timeouts.read_secs),
        ("timeouts.idle_secs", config.timeouts.idle_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.side.expect_continue > 2 {
        errors.push(ValidationError::new(
            "side.expect_continue",
            "must be 0, 1 or 2",
        ));
    }
    if config.side.flush_threshold == 0 {
        errors.push(ValidationError::new(
            "side.flush_threshold",
            "must be greater than 0",
        ));
    }

    if config.proxy.proxy_name.trim().is_empty()
        || config.proxy.proxy_name.chars().any(char::is_whitespace)
    {
        errors.push(ValidationError::new(
            "proxy.proxy_name",
            "must be a single non-empty token",
        ));
    }
    for (i, range) in config.proxy.allowed_ports.iter().enumerate() {
        if range.from > range.to {
            errors.push(ValidationError::new(
                &format!("proxy.allowed_ports[{}]", i),
                format!("empty range {}-{}", range.from, range.to),
            ));
        }
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid address {:?}", config.observability.metrics_address),
        ));
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
    use crate::config::schema::PortRange;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&UpstreamConfig::default()).is_ok());
    }

    #[test]
    fn reports_every_error() {
        let mut config = UpstreamConfig::default();
        config.timeouts.read_secs = 0;
        config.side.expect_continue = 7;
        config.proxy.allowed_ports.push(PortRange { from: 10, to: 5 });
        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "timeouts.read_secs",
                "side.expect_continue",
                "proxy.allowed_ports[2]"
            ]
        );
    }

    #[test]
    fn rejects_bad_metrics_address_only_when_enabled() {
        let mut config = UpstreamConfig::default();
        config.observability.metrics_address = "nope".into();
        assert!(validate_config(&config).is_ok());
        config.observability.metrics_enabled = true;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn proxy_name_must_be_one_token() {
        let mut config = UpstreamConfig::default();
        config.proxy.proxy_name = "two words".into();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "proxy.proxy_name");
    }
}
