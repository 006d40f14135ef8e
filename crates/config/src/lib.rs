//! Configuration for certkeeper
//!
//! The configuration is a single TOML document describing one certificate:
//! who it is for, how to reach the authority, how to publish the challenge,
//! and where the issued material is installed. The same file is written by
//! `certkeeper issue --save-config` and read back by `certkeeper renew`, so
//! unattended renewals never need the operator's input again.
//!
//! # Example
//!
//! ```toml
//! [identity]
//! value = "203.0.113.10"
//!
//! [authority]
//! access-key = "..."
//! validity-days = 90
//!
//! [install]
//! live-dir = "/etc/certkeeper/live"
//! reload-command = ["systemctl", "reload", "nginx"]
//! ```

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use validator::Validate;

mod identity;
mod key_spec;
mod validate;

pub use identity::{Identity, IdentityKind};
pub use key_spec::{KeySpec, DEFAULT_EC_CURVE, DEFAULT_RSA_BITS};
pub use validate::{validate_config, ValidationWarning};

/// Environment variable that overrides the configured access key
pub const ACCESS_KEY_ENV: &str = "CERTKEEPER_ACCESS_KEY";

/// Default authority API endpoint
pub const DEFAULT_API_BASE: &str = "https://api.zerossl.com";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write configuration {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid identity '{value}': {reason}")]
    InvalidIdentity { value: String, reason: String },

    #[error("unsupported key spec '{0}' (expected rsa:<bits> or ec:<curve>)")]
    UnsupportedKeySpec(String),

    #[error("no authority access key configured (set authority.access-key or CERTKEEPER_ACCESS_KEY)")]
    MissingAccessKey,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete configuration for one managed certificate
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct IssuanceConfig {
    pub identity: IdentityConfig,

    #[validate(nested)]
    pub authority: AuthorityConfig,

    #[serde(default)]
    pub key: KeyConfig,

    #[serde(default)]
    pub challenge: ChallengeConfig,

    #[serde(default)]
    #[validate(nested)]
    pub polling: PollingConfig,

    #[validate(nested)]
    pub install: InstallConfig,
}

impl IssuanceConfig {
    /// Load a configuration file and validate it
    ///
    /// This is the reload path used by renewal mode. The access key from
    /// [`ACCESS_KEY_ENV`] takes precedence over the file when set.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_toml(&content)?;

        if let Ok(key) = std::env::var(ACCESS_KEY_ENV) {
            if !key.trim().is_empty() {
                debug!("Using access key from {}", ACCESS_KEY_ENV);
                config.authority.access_key = key;
            }
        }

        for warning in config.validate()? {
            tracing::warn!(path = %path.display(), "{}", warning.message);
        }

        info!(
            path = %path.display(),
            identity = %config.identity.value,
            "Loaded issuance configuration"
        );
        Ok(config)
    }

    /// Parse a configuration document without validating it
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Persist the configuration for later renewals
    ///
    /// The file carries the access credential, so it is written owner-only
    /// on Unix.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(write_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(write_err)?;
        }

        info!(path = %path.display(), "Saved issuance configuration");
        Ok(())
    }

    /// Validate the configuration, returning advisory warnings
    pub fn validate(&self) -> Result<Vec<ValidationWarning>, ConfigError> {
        validate_config(self)
    }

    /// The validated identity this configuration issues for
    pub fn identity(&self) -> Result<Identity, ConfigError> {
        self.identity.resolve()
    }
}

/// Identity section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdentityConfig {
    /// Hostname or IP literal
    pub value: String,
    /// Explicit kind; inferred from the value when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<IdentityKind>,
}

impl IdentityConfig {
    pub fn resolve(&self) -> Result<Identity, ConfigError> {
        match self.kind {
            Some(kind) => Identity::new(kind, self.value.clone()),
            None => Identity::infer(self.value.clone()),
        }
    }
}

/// Certificate authority section
#[derive(Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct AuthorityConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Opaque API credential
    #[serde(default)]
    pub access_key: String,

    #[serde(default = "default_validity_days")]
    #[validate(range(min = 1, max = 365))]
    pub validity_days: u32,

    /// Ask the authority to reject orders whose CSR names anything else
    #[serde(default = "default_true")]
    pub strict_domains: bool,

    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 600))]
    pub request_timeout_secs: u64,
}

impl AuthorityConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl fmt::Debug for AuthorityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityConfig")
            .field("api_base", &self.api_base)
            .field("access_key", &"<redacted>")
            .field("validity_days", &self.validity_days)
            .field("strict_domains", &self.strict_domains)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Private key section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KeyConfig {
    #[serde(default)]
    pub spec: KeySpec,
}

/// Challenge publication section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChallengeConfig {
    /// Existing document root served on port 80; when absent a temporary
    /// server is started instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webroot: Option<PathBuf>,

    /// Bind address for the temporary challenge server
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            webroot: None,
            bind: default_bind(),
        }
    }
}

/// Status polling section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_secs")]
    #[validate(range(min = 1, max = 300))]
    pub interval_secs: u64,

    #[serde(default = "default_poll_max_attempts")]
    #[validate(range(min = 1, max = 1000))]
    pub max_attempts: u32,

    #[serde(default = "default_token_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub token_attempts: u32,

    #[serde(default = "default_token_retry_delay_secs")]
    #[validate(range(max = 60))]
    pub token_retry_delay_secs: u64,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn token_retry_delay(&self) -> Duration {
        Duration::from_secs(self.token_retry_delay_secs)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            max_attempts: default_poll_max_attempts(),
            token_attempts: default_token_attempts(),
            token_retry_delay_secs: default_token_retry_delay_secs(),
        }
    }
}

/// Installation section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct InstallConfig {
    /// Directory holding the active key and certificates under fixed names
    pub live_dir: PathBuf,

    /// Parent for per-attempt working directories (system temp otherwise)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    #[serde(default = "default_renew_before_days")]
    #[validate(range(max = 365))]
    pub renew_before_days: u32,

    /// Command run after a successful install, e.g. a proxy reload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload_command: Option<Vec<String>>,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_validity_days() -> u32 {
    90
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_max_attempts() -> u32 {
    36
}

fn default_token_attempts() -> u32 {
    3
}

fn default_token_retry_delay_secs() -> u64 {
    2
}

fn default_renew_before_days() -> u32 {
    30
}

#[cfg(test)]
pub(crate) fn test_config() -> IssuanceConfig {
    IssuanceConfig {
        identity: IdentityConfig {
            value: "203.0.113.10".to_string(),
            kind: None,
        },
        authority: AuthorityConfig {
            api_base: default_api_base(),
            access_key: "test-access-key".to_string(),
            validity_days: 90,
            strict_domains: true,
            request_timeout_secs: 30,
        },
        key: KeyConfig::default(),
        challenge: ChallengeConfig::default(),
        polling: PollingConfig::default(),
        install: InstallConfig {
            live_dir: PathBuf::from("/etc/certkeeper/live"),
            work_dir: None,
            renew_before_days: 30,
            reload_command: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[identity]
value = "example.com"

[authority]
access-key = "abc"

[install]
live-dir = "/srv/certs"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = IssuanceConfig::from_toml(MINIMAL).unwrap();

        assert_eq!(config.authority.api_base, DEFAULT_API_BASE);
        assert_eq!(config.authority.validity_days, 90);
        assert!(config.authority.strict_domains);
        assert_eq!(config.key.spec, KeySpec::ec("prime256v1"));
        assert_eq!(config.challenge.bind, "0.0.0.0:80".parse().unwrap());
        assert_eq!(config.polling.interval(), Duration::from_secs(5));
        assert_eq!(config.polling.max_attempts, 36);
        assert_eq!(config.polling.token_attempts, 3);
        assert_eq!(config.install.renew_before_days, 30);

        let identity = config.identity().unwrap();
        assert_eq!(identity.kind(), IdentityKind::Domain);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
[identity]
value = "203.0.113.10"
kind = "ip"

[authority]
api-base = "https://authority.test"
access-key = "abc"
validity-days = 365
strict-domains = false

[key]
spec = "rsa:4096"

[challenge]
webroot = "/var/www/html"
bind = "127.0.0.1:8080"

[polling]
interval-secs = 10
max-attempts = 90

[install]
live-dir = "/srv/certs"
work-dir = "/var/lib/certkeeper"
renew-before-days = 14
reload-command = ["systemctl", "reload", "nginx"]
"#;
        let config = IssuanceConfig::from_toml(content).unwrap();

        assert_eq!(config.identity.kind, Some(IdentityKind::Ip));
        assert_eq!(config.key.spec, KeySpec::rsa(4096));
        assert_eq!(config.challenge.webroot, Some(PathBuf::from("/var/www/html")));
        assert_eq!(config.polling.max_attempts, 90);
        assert_eq!(
            config.install.reload_command,
            Some(vec![
                "systemctl".to_string(),
                "reload".to_string(),
                "nginx".to_string()
            ])
        );
    }

    #[test]
    fn test_invalid_key_spec_is_parse_error() {
        let content = MINIMAL.replace("[install]", "[key]\nspec = \"dsa:1024\"\n\n[install]");
        assert!(IssuanceConfig::from_toml(&content).is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("certkeeper.toml");

        let config = test_config();
        config.save(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = IssuanceConfig::load(&path).unwrap();
        assert_eq!(loaded.identity, config.identity);
        assert_eq!(loaded.install, config.install);
        assert_eq!(loaded.key, config.key);
    }

    #[test]
    fn test_load_missing_file() {
        let err = IssuanceConfig::load(Path::new("/nonexistent/certkeeper.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_debug_redacts_access_key() {
        let config = test_config();
        let debug = format!("{:?}", config.authority);
        assert!(!debug.contains("test-access-key"));
        assert!(debug.contains("<redacted>"));
    }
}
