//! Certificate identities
//!
//! An identity is the single name a certificate is requested for: either a
//! DNS hostname or a bare IP literal. Construction validates the value, so an
//! [`Identity`] in hand is always well-formed for its kind.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Maximum length of a DNS name in presentation format
const MAX_HOSTNAME_LEN: usize = 253;

/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;

/// The kind of name a certificate is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    /// A DNS hostname (`DNS:` SAN)
    Domain,
    /// An IPv4 or IPv6 literal (`IP:` SAN)
    Ip,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Domain => "domain",
            IdentityKind::Ip => "ip",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "domain" | "dns" => Ok(IdentityKind::Domain),
            "ip" => Ok(IdentityKind::Ip),
            other => Err(ConfigError::Invalid(format!(
                "unknown identity kind '{}' (expected 'domain' or 'ip')",
                other
            ))),
        }
    }
}

/// A validated certificate identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    kind: IdentityKind,
    value: String,
}

impl Identity {
    /// Create an identity of an explicit kind, validating the value
    pub fn new(kind: IdentityKind, value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        match kind {
            IdentityKind::Domain => validate_hostname(&value)?,
            IdentityKind::Ip => {
                value
                    .parse::<IpAddr>()
                    .map_err(|_| invalid(&value, "not an IPv4 or IPv6 literal"))?;
            }
        }
        Ok(Self { kind, value })
    }

    /// Create an identity, inferring its kind from the value
    ///
    /// Anything that parses as an IP literal is an IP identity; everything
    /// else must be a valid hostname.
    pub fn infer(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        let kind = if value.parse::<IpAddr>().is_ok() {
            IdentityKind::Ip
        } else {
            IdentityKind::Domain
        };
        Self::new(kind, value)
    }

    pub fn domain(value: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(IdentityKind::Domain, value)
    }

    pub fn ip(value: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(IdentityKind::Ip, value)
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The parsed address for IP identities
    pub fn ip_addr(&self) -> Option<IpAddr> {
        match self.kind {
            IdentityKind::Ip => self.value.parse().ok(),
            IdentityKind::Domain => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

fn invalid(value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidIdentity {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Check RFC 1123 hostname syntax
///
/// Wildcards and IP literals are rejected: neither can be validated with a
/// file-based challenge under a DNS SAN.
fn validate_hostname(value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(invalid(value, "empty hostname"));
    }
    if value.len() > MAX_HOSTNAME_LEN {
        return Err(invalid(value, "hostname longer than 253 characters"));
    }
    if value.parse::<IpAddr>().is_ok() {
        return Err(invalid(value, "IP literal given for a domain identity"));
    }

    let labels: Vec<&str> = value.split('.').collect();
    for label in &labels {
        if label.is_empty() {
            return Err(invalid(value, "empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(invalid(value, "label longer than 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid(value, "label starts or ends with '-'"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(invalid(value, "label contains characters outside [A-Za-z0-9-]"));
        }
    }

    // A numeric top-level label would make the name indistinguishable from
    // a (possibly truncated) IPv4 address.
    if labels
        .last()
        .is_some_and(|tld| tld.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(invalid(value, "numeric top-level label"));
    }

    Ok(())
}
