//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every server address is usable and unique
//! - Validate value ranges (readiness timeout, log level)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GraceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::GraceConfig;
use crate::lifecycle::fork::HandoffMode;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("at least one server must be configured")]
    NoServers,

    #[error("server #{0} has an empty address")]
    EmptyAddress(usize),

    #[error("address {0:?} is not host:port")]
    MalformedAddress(String),

    #[error("address {0:?} is configured more than once")]
    DuplicateAddress(String),

    #[error("TLS for {0} needs both cert_path and key_path")]
    IncompleteTls(String),

    #[error("readiness_timeout_secs must be > 0 for immediate handoff")]
    ZeroReadinessTimeout,

    #[error("unknown log level {0:?}")]
    UnknownLogLevel(String),
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &GraceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.servers.is_empty() {
        errors.push(ValidationError::NoServers);
    }

    let mut seen = HashSet::new();
    for (index, server) in config.servers.iter().enumerate() {
        // Bound and passed to a child verbatim, so no trimming here.
        let address = server.address.as_str();
        if address.trim().is_empty() {
            errors.push(ValidationError::EmptyAddress(index));
            continue;
        }
        if !is_host_port(address) {
            errors.push(ValidationError::MalformedAddress(address.to_string()));
        }
        if !seen.insert(address) {
            errors.push(ValidationError::DuplicateAddress(address.to_string()));
        }
        if let Some(tls) = &server.tls {
            if tls.cert_path.trim().is_empty() || tls.key_path.trim().is_empty() {
                errors.push(ValidationError::IncompleteTls(address.to_string()));
            }
        }
    }

    if config.restart.handoff == HandoffMode::Immediate && config.timeouts.readiness_timeout_secs == 0 {
        errors.push(ValidationError::ZeroReadinessTimeout);
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::UnknownLogLevel(
            config.observability.log_level.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// `host:port` with a numeric port; the host may be empty (`":8080"`).
fn is_host_port(address: &str) -> bool {
    if address.contains(char::is_whitespace) {
        return false;
    }
    match address.rsplit_once(':') {
        Some((_, port)) => port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ServerConfig, TlsConfig};

    fn config(addresses: &[&str]) -> GraceConfig {
        GraceConfig {
            servers: addresses
                .iter()
                .map(|a| ServerConfig {
                    address: a.to_string(),
                    tls: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_go_style_and_full_addresses() {
        assert!(validate_config(&config(&[":8080", "127.0.0.1:8443", "[::1]:9000"])).is_ok());
    }

    #[test]
    fn rejects_empty_server_list() {
        assert_eq!(validate_config(&config(&[])), Err(vec![ValidationError::NoServers]));
    }

    #[test]
    fn collects_every_error() {
        let mut cfg = config(&[":8080", ":8080", "localhost", ""]);
        cfg.observability.log_level = "loud".into();
        cfg.restart.handoff = HandoffMode::Immediate;
        cfg.timeouts.readiness_timeout_secs = 0;

        let errors = validate_config(&cfg).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::DuplicateAddress(":8080".into()),
                ValidationError::MalformedAddress("localhost".into()),
                ValidationError::EmptyAddress(3),
                ValidationError::ZeroReadinessTimeout,
                ValidationError::UnknownLogLevel("loud".into()),
            ]
        );
    }

    #[test]
    fn rejects_surrounding_whitespace() {
        assert_eq!(
            validate_config(&config(&[" :8080", "127.0.0.1:8443\t"])),
            Err(vec![
                ValidationError::MalformedAddress(" :8080".into()),
                ValidationError::MalformedAddress("127.0.0.1:8443\t".into()),
            ])
        );
    }

    #[test]
    fn rejects_incomplete_tls() {
        let mut cfg = config(&[":8443"]);
        cfg.servers[0].tls = Some(TlsConfig {
            cert_path: "cert.pem".into(),
            key_path: " ".into(),
        });
        assert_eq!(
            validate_config(&cfg),
            Err(vec![ValidationError::IncompleteTls(":8443".into())])
        );
    }
}
