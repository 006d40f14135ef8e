//! Authority-side order state as observed by the client.

use std::fmt;

/// Validation method requested when triggering a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMethod {
    /// Plain-HTTP file containing a hash of the CSR
    HttpCsrHash,
}

impl ValidationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationMethod::HttpCsrHash => "HTTP_CSR_HASH",
        }
    }
}

/// Order status reported by the authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Draft,
    PendingValidation,
    Issued,
    Failed,
    Cancelled,
    Revoked,
    Expired,
    /// Empty, malformed or unrecognised status
    Unknown(String),
}

impl OrderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "draft" => OrderStatus::Draft,
            "pending_validation" | "pending" => OrderStatus::PendingValidation,
            "issued" => OrderStatus::Issued,
            "failed" => OrderStatus::Failed,
            "cancelled" | "canceled" => OrderStatus::Cancelled,
            "revoked" => OrderStatus::Revoked,
            "expired" => OrderStatus::Expired,
            _ => OrderStatus::Unknown(raw.to_string()),
        }
    }

    /// Statuses from which the order can never reach `issued`
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            OrderStatus::Failed
                | OrderStatus::Cancelled
                | OrderStatus::Revoked
                | OrderStatus::Expired
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Draft => f.write_str("draft"),
            OrderStatus::PendingValidation => f.write_str("pending_validation"),
            OrderStatus::Issued => f.write_str("issued"),
            OrderStatus::Failed => f.write_str("failed"),
            OrderStatus::Cancelled => f.write_str("cancelled"),
            OrderStatus::Revoked => f.write_str("revoked"),
            OrderStatus::Expired => f.write_str("expired"),
            OrderStatus::Unknown(raw) if raw.is_empty() => f.write_str("unknown"),
            OrderStatus::Unknown(raw) => write!(f, "unknown ({})", raw),
        }
    }
}

/// File-validation token for one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeToken {
    /// Absolute URL path the authority will request, e.g.
    /// `/.well-known/pki-validation/<hash>.txt`
    pub relative_path: String,
    /// Exact file content
    pub content: Vec<u8>,
    /// Full URL the authority fetches; informational
    pub verification_url: String,
}

/// Certificate material as downloaded, before the key is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedBundle {
    pub leaf: String,
    /// Intermediate CA certificates; may be empty
    pub chain: String,
}
