//! Private key specifications
//!
//! Textual form is `rsa:<bits>` or `ec:<curve>`. The bare algorithm names
//! select the defaults (`rsa` = 2048 bits, `ec` = prime256v1).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Default RSA modulus size
pub const DEFAULT_RSA_BITS: u32 = 2048;

/// Default EC curve name
pub const DEFAULT_EC_CURVE: &str = "prime256v1";

/// Algorithm and parameter for a freshly generated private key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeySpec {
    /// RSA with the given modulus size in bits
    Rsa { bits: u32 },
    /// ECDSA over a named curve
    Ec { curve: String },
}

impl KeySpec {
    pub fn rsa(bits: u32) -> Self {
        KeySpec::Rsa { bits }
    }

    pub fn ec(curve: impl Into<String>) -> Self {
        KeySpec::Ec {
            curve: curve.into(),
        }
    }
}

impl Default for KeySpec {
    fn default() -> Self {
        KeySpec::ec(DEFAULT_EC_CURVE)
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Rsa { bits } => write!(f, "rsa:{}", bits),
            KeySpec::Ec { curve } => write!(f, "ec:{}", curve),
        }
    }
}

impl FromStr for KeySpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unsupported = || ConfigError::UnsupportedKeySpec(s.to_string());
        let trimmed = s.trim();
        let (algorithm, parameter) = match trimmed.split_once(':') {
            Some((algorithm, parameter)) => (algorithm, Some(parameter.trim())),
            None => (trimmed, None),
        };

        match (algorithm.to_ascii_lowercase().as_str(), parameter) {
            ("rsa", None) => Ok(KeySpec::rsa(DEFAULT_RSA_BITS)),
            ("ec" | "ecdsa", None) => Ok(KeySpec::ec(DEFAULT_EC_CURVE)),
            (_, Some("")) => Err(unsupported()),
            ("rsa", Some(bits)) => bits.parse().map(KeySpec::rsa).map_err(|_| unsupported()),
            ("ec" | "ecdsa", Some(curve)) => Ok(KeySpec::ec(curve.to_ascii_lowercase())),
            _ => Err(unsupported()),
        }
    }
}

impl TryFrom<String> for KeySpec {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeySpec> for String {
    fn from(spec: KeySpec) -> Self {
        spec.to_string()
    }
}
