//! Configuration validation
//!
//! Structural rules (ranges, lengths) come from the `validator` derives on
//! the configuration types. This module adds the semantic checks that need
//! more than one field, and collects advisory warnings for `certkeeper check`.

use std::net::IpAddr;

use tracing::trace;
use validator::Validate;

use crate::{ConfigError, IssuanceConfig};

/// Port the authority fetches challenge files from
const CHALLENGE_PORT: u16 = 80;

/// Validity periods the authority is known to accept
const COMMON_VALIDITY_DAYS: [u32; 2] = [90, 365];

/// A non-fatal configuration finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Validate a configuration, returning advisory warnings on success
pub fn validate_config(config: &IssuanceConfig) -> Result<Vec<ValidationWarning>, ConfigError> {
    trace!("Validating issuance configuration");

    Validate::validate(config).map_err(|e| ConfigError::Invalid(e.to_string()))?;

    let identity = config.identity.resolve()?;

    if config.authority.access_key.trim().is_empty() {
        return Err(ConfigError::MissingAccessKey);
    }

    url::Url::parse(&config.authority.api_base).map_err(|e| {
        ConfigError::Invalid(format!(
            "authority api-base '{}' is not a valid URL: {}",
            config.authority.api_base, e
        ))
    })?;

    if let Some(ref command) = config.install.reload_command {
        if command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "install reload-command must name a program".to_string(),
            ));
        }
    }

    let mut warnings = Vec::new();

    if !COMMON_VALIDITY_DAYS.contains(&config.authority.validity_days) {
        warnings.push(ValidationWarning::new(format!(
            "validity-days {} is unusual; the authority commonly accepts 90 or 365",
            config.authority.validity_days
        )));
    }

    match config.challenge.webroot {
        Some(ref webroot) if !webroot.is_dir() => {
            warnings.push(ValidationWarning::new(format!(
                "webroot {} does not exist yet; it must be served over plain HTTP on port 80",
                webroot.display()
            )));
        }
        Some(_) => {}
        None if config.challenge.bind.port() != CHALLENGE_PORT => {
            warnings.push(ValidationWarning::new(format!(
                "challenge server binds port {}; the authority validates over port {}",
                config.challenge.bind.port(),
                CHALLENGE_PORT
            )));
        }
        None => {}
    }

    if let Some(ip) = identity.ip_addr() {
        if is_non_public(&ip) {
            warnings.push(ValidationWarning::new(format!(
                "{} is not publicly routable; the authority cannot reach it",
                ip
            )));
        }
    }

    trace!(warnings = warnings.len(), "Configuration validated");
    Ok(warnings)
}

fn is_non_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_config;

    #[test]
    fn test_valid_config_has_no_errors() {
        let config = test_config();
        let warnings = validate_config(&config).unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    #[test]
    fn test_missing_access_key() {
        let mut config = test_config();
        config.authority.access_key = "   ".to_string();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingAccessKey)
        ));
    }

    #[test]
    fn test_zero_validity_days_rejected() {
        let mut config = test_config();
        config.authority.validity_days = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_empty_reload_command_rejected() {
        let mut config = test_config();
        config.install.reload_command = Some(vec![]);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_private_ip_warns() {
        let mut config = test_config();
        config.identity.value = "10.1.2.3".to_string();
        let warnings = validate_config(&config).unwrap();
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("not publicly routable")));
    }

    #[test]
    fn test_non_standard_port_warns() {
        let mut config = test_config();
        config.challenge.bind = "0.0.0.0:8080".parse().unwrap();
        let warnings = validate_config(&config).unwrap();
        assert!(warnings.iter().any(|w| w.message.contains("port 8080")));
    }
}
