//! Response extraction strategies
//!
//! The authority is not consistent about where it puts things: validation
//! info is sometimes keyed by a slightly different identity string, and the
//! download endpoint has used more than one field naming. Each shape is a
//! named strategy; strategies are tried in order and the first that yields a
//! value wins.

use serde_json::Value;
use tracing::trace;

use super::order::{ChallengeToken, DownloadedBundle};

/// One way of pulling a `T` out of a parsed response
///
/// The `&str` argument is the lookup key (for tokens, the identity value).
pub struct Extraction<T: 'static> {
    pub name: &'static str,
    pub extract: fn(&Value, &str) -> Option<T>,
}

/// Try `strategies` in order against `response`
pub fn first_match<T>(strategies: &[Extraction<T>], response: &Value, key: &str) -> Option<T> {
    strategies.iter().find_map(|strategy| {
        let value = (strategy.extract)(response, key)?;
        trace!(strategy = strategy.name, "Extraction strategy matched");
        Some(value)
    })
}

/// Order identifier in a create-order response
pub const ORDER_ID: &[Extraction<String>] = &[
    Extraction {
        name: "id",
        extract: |response, _| non_empty_str(response.get("id")),
    },
    Extraction {
        name: "certificate.id",
        extract: |response, _| non_empty_str(response.pointer("/certificate/id")),
    },
];

/// Validation token in an order detail response
pub const VALIDATION_TOKEN: &[Extraction<ChallengeToken>] = &[
    Extraction {
        name: "exact-identity",
        extract: |response, identity| {
            other_methods(response)?
                .get(identity)
                .and_then(token_from_entry)
        },
    },
    Extraction {
        name: "first-entry",
        extract: |response, _| other_methods(response)?.values().find_map(token_from_entry),
    },
];

/// Certificate material in a JSON download response
pub const CERTIFICATE_BUNDLE: &[Extraction<DownloadedBundle>] = &[
    Extraction {
        name: "crt-file-keys",
        extract: |response, _| bundle_from_keys(response, "certificate.crt", "ca_bundle.crt"),
    },
    Extraction {
        name: "plain-keys",
        extract: |response, _| bundle_from_keys(response, "certificate", "ca_bundle"),
    },
];

/// Order status field; `None` when absent
pub fn status(response: &Value) -> Option<&str> {
    response.get("status").and_then(Value::as_str)
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn other_methods(response: &Value) -> Option<&serde_json::Map<String, Value>> {
    response.pointer("/validation/other_methods")?.as_object()
}

fn token_from_entry(entry: &Value) -> Option<ChallengeToken> {
    let verification_url = entry
        .get("file_validation_url_http")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let relative_path = match entry.get("file_validation_path").and_then(Value::as_str) {
        Some(path) if !path.is_empty() => normalize_path(path),
        _ => url::Url::parse(&verification_url).ok()?.path().to_string(),
    };
    if relative_path.len() <= 1 {
        return None;
    }

    let content = match entry.get("file_validation_content")? {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines
            .iter()
            .map(|line| line.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()?
            .join("\n"),
        _ => return None,
    };

    Some(ChallengeToken {
        relative_path,
        content: content.into_bytes(),
        verification_url,
    })
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn bundle_from_keys(response: &Value, leaf_key: &str, chain_key: &str) -> Option<DownloadedBundle> {
    let leaf = response.get(leaf_key)?.as_str()?;
    if leaf.trim().is_empty() {
        return None;
    }
    let chain = response
        .get(chain_key)
        .and_then(Value::as_str)
        .unwrap_or_default();

    Some(DownloadedBundle {
        leaf: leaf.to_string(),
        chain: chain.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_detail() -> Value {
        json!({
            "id": "abc123",
            "status": "draft",
            "validation": {
                "other_methods": {
                    "203.0.113.10": {
                        "file_validation_url_http": "http://203.0.113.10/.well-known/pki-validation/XYZ.txt",
                        "file_validation_content": ["hash", "comodoca.com", "nonce"]
                    },
                    "other.example": {
                        "file_validation_path": "/.well-known/pki-validation/OTHER.txt",
                        "file_validation_content": "other-token"
                    }
                }
            }
        })
    }

    #[test]
    fn test_order_id_strategies() {
        assert_eq!(
            first_match(ORDER_ID, &json!({"id": "abc123"}), ""),
            Some("abc123".to_string())
        );
        assert_eq!(
            first_match(ORDER_ID, &json!({"certificate": {"id": "nested"}}), ""),
            Some("nested".to_string())
        );
        assert_eq!(first_match(ORDER_ID, &json!({"id": ""}), ""), None);
        assert_eq!(
            first_match(
                ORDER_ID,
                &json!({"success": false, "error": {"code": 2817, "type": "invalid_csr"}}),
                ""
            ),
            None
        );
    }

    #[test]
    fn test_exact_identity_token_wins() {
        let token = first_match(VALIDATION_TOKEN, &order_detail(), "203.0.113.10").unwrap();

        assert_eq!(token.relative_path, "/.well-known/pki-validation/XYZ.txt");
        assert_eq!(token.content, b"hash\ncomodoca.com\nnonce".to_vec());
        assert_eq!(
            token.verification_url,
            "http://203.0.113.10/.well-known/pki-validation/XYZ.txt"
        );
    }

    #[test]
    fn test_falls_back_to_first_entry() {
        let token = first_match(VALIDATION_TOKEN, &order_detail(), "mismatched.example").unwrap();
        // serde_json maps iterate in key order without preserve_order
        assert_eq!(token.relative_path, "/.well-known/pki-validation/XYZ.txt");
    }

    #[test]
    fn test_explicit_path_is_used_verbatim() {
        let token = first_match(VALIDATION_TOKEN, &order_detail(), "other.example").unwrap();
        assert_eq!(token.relative_path, "/.well-known/pki-validation/OTHER.txt");
        assert_eq!(token.content, b"other-token".to_vec());
        assert_eq!(token.verification_url, "");
    }

    #[test]
    fn test_no_validation_info() {
        assert!(first_match(VALIDATION_TOKEN, &json!({"id": "abc"}), "x").is_none());
        assert!(first_match(
            VALIDATION_TOKEN,
            &json!({"validation": {"other_methods": {}}}),
            "x"
        )
        .is_none());
        // entries without content are not applicable
        assert!(first_match(
            VALIDATION_TOKEN,
            &json!({"validation": {"other_methods": {"x": {"file_validation_path": "/a"}}}}),
            "x"
        )
        .is_none());
    }

    #[test]
    fn test_bundle_strategies() {
        let bundle = first_match(
            CERTIFICATE_BUNDLE,
            &json!({"certificate.crt": "LEAF", "ca_bundle.crt": "CHAIN"}),
            "",
        )
        .unwrap();
        assert_eq!(bundle.leaf, "LEAF");
        assert_eq!(bundle.chain, "CHAIN");

        let bundle =
            first_match(CERTIFICATE_BUNDLE, &json!({"certificate": "LEAF"}), "").unwrap();
        assert_eq!(bundle.chain, "");

        assert!(first_match(CERTIFICATE_BUNDLE, &json!({"certificate.crt": "  "}), "").is_none());
    }

    #[test]
    fn test_status_field() {
        assert_eq!(status(&json!({"status": "issued"})), Some("issued"));
        assert_eq!(status(&json!({})), None);
    }
}
