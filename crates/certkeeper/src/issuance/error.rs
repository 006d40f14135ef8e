//! Issuance error types.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use certkeeper_config::ConfigError;
use thiserror::Error;

/// Key and CSR generation errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("unsupported key spec: {0}")]
    UnsupportedKeySpec(String),

    #[error("identity cannot be encoded in a CSR: {0}")]
    InvalidIdentity(String),

    #[error("key generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("failed to write key material: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate authority errors
///
/// Variants that originate from an authority response carry the raw body so
/// the operator can see the authority's own diagnostic.
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("order creation failed: {reason}")]
    OrderCreationFailed { reason: String },

    #[error("no validation info for order {order_id}")]
    NoValidationInfo {
        order_id: String,
        body: Option<String>,
    },

    #[error("certificate download failed for order {order_id}: {reason}")]
    DownloadFailed {
        order_id: String,
        reason: String,
        body: Option<String>,
    },

    #[error("authority request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid authority endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

impl AuthorityError {
    /// Raw authority response attached to this error, if any
    pub fn response_body(&self) -> Option<&str> {
        match self {
            AuthorityError::OrderCreationFailed { reason } => Some(reason),
            AuthorityError::NoValidationInfo { body, .. }
            | AuthorityError::DownloadFailed { body, .. } => body.as_deref(),
            AuthorityError::Http(_) | AuthorityError::Endpoint(_) => None,
        }
    }
}

/// Challenge publication errors
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("binding {addr} requires elevated privileges (run as root or pass a webroot)")]
    PrivilegeRequired { addr: SocketAddr },

    #[error("failed to bind challenge server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("invalid challenge path: {0}")]
    InvalidPath(String),

    #[error("failed to write challenge file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Artifact installation errors
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("install failed: certificate bundle has an empty {0}")]
    MissingField(&'static str),

    #[error("install failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl InstallError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| InstallError::Io { path, source }
    }
}

/// Top-level failure of one issuance attempt
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("order {order_id} ended in terminal status '{status}'")]
    OrderFailed { order_id: String, status: String },

    #[error("order {order_id} was not issued after {attempts} status checks")]
    ValidationTimeout { order_id: String, attempts: u32 },

    #[error("failed to prepare working directory: {0}")]
    WorkDir(std::io::Error),

    #[error("issuance attempt cancelled")]
    Cancelled,
}

/// Failure classes reported to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input; the operator must fix the configuration
    Configuration,
    /// The authority rejected or failed a request
    Authority,
    /// Polling exhausted without the order being issued
    ValidationTimeout,
    /// Local environment problem: privileges, ports, filesystem
    Environment,
    /// Interrupted by a signal
    Cancelled,
}

impl ErrorCategory {
    /// Process exit code for this category
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorCategory::Configuration => 2,
            ErrorCategory::Authority => 3,
            ErrorCategory::ValidationTimeout => 4,
            ErrorCategory::Environment => 5,
            ErrorCategory::Cancelled => 130,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Configuration => "configuration error",
            ErrorCategory::Authority => "authority error",
            ErrorCategory::ValidationTimeout => "validation timeout",
            ErrorCategory::Environment => "environment error",
            ErrorCategory::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl IssuanceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            IssuanceError::Config(_)
            | IssuanceError::Key(KeyError::UnsupportedKeySpec(_))
            | IssuanceError::Key(KeyError::InvalidIdentity(_)) => ErrorCategory::Configuration,
            IssuanceError::Key(_) | IssuanceError::Publish(_) | IssuanceError::WorkDir(_) => {
                ErrorCategory::Environment
            }
            IssuanceError::Authority(_)
            | IssuanceError::OrderFailed { .. }
            | IssuanceError::Install(InstallError::MissingField(_)) => ErrorCategory::Authority,
            IssuanceError::Install(InstallError::Io { .. }) => ErrorCategory::Environment,
            IssuanceError::ValidationTimeout { .. } => ErrorCategory::ValidationTimeout,
            IssuanceError::Cancelled => ErrorCategory::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let err = IssuanceError::from(KeyError::UnsupportedKeySpec("dsa".into()));
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let err = IssuanceError::from(AuthorityError::OrderCreationFailed {
            reason: "{}".into(),
        });
        assert_eq!(err.category(), ErrorCategory::Authority);
        assert_eq!(err.category().exit_code(), 3);

        let err = IssuanceError::from(PublishError::PrivilegeRequired {
            addr: "0.0.0.0:80".parse().unwrap(),
        });
        assert_eq!(err.category(), ErrorCategory::Environment);

        let err = IssuanceError::ValidationTimeout {
            order_id: "abc".into(),
            attempts: 36,
        };
        assert_eq!(err.category(), ErrorCategory::ValidationTimeout);
        assert_eq!(err.to_string(), "order abc was not issued after 36 status checks");
    }

    #[test]
    fn test_response_body() {
        let err = AuthorityError::NoValidationInfo {
            order_id: "abc".into(),
            body: Some(r#"{"id":"abc"}"#.into()),
        };
        assert_eq!(err.response_body(), Some(r#"{"id":"abc"}"#));
    }
}
