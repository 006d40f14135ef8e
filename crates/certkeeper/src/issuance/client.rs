//! Certificate authority API client
//!
//! A typed wrapper over the authority's HTTP/JSON control API. Every request
//! carries the access key as the `access_key` query parameter; URLs are never
//! logged with their query so the key stays out of log output.
//!
//! The client keeps the body of the most recent response so a failed attempt
//! can show the operator exactly what the authority said.

use std::io::{Cursor, Read};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{debug, trace, warn};
use url::Url;

use certkeeper_config::AuthorityConfig;

use super::error::AuthorityError;
use super::extract::{self, first_match};
use super::order::{ChallengeToken, DownloadedBundle, OrderStatus, ValidationMethod};

/// Archive member holding the leaf certificate
const ARCHIVE_LEAF: &str = "certificate.crt";

/// Archive member holding the CA bundle
const ARCHIVE_CHAIN: &str = "ca_bundle.crt";

/// gzip magic bytes
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// zip local file header signature
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

/// Operations the issuance state machine needs from an authority
#[async_trait]
pub trait Authority: Send + Sync {
    /// Submit a CSR; returns the order id
    async fn create_order(
        &self,
        csr_pem: &str,
        domains: &str,
        validity_days: u32,
    ) -> Result<String, AuthorityError>;

    /// Look up the file-validation token for `identity`
    async fn fetch_validation_token(
        &self,
        order_id: &str,
        identity: &str,
    ) -> Result<ChallengeToken, AuthorityError>;

    /// Ask the authority to validate; returns whether it acknowledged
    async fn trigger_challenge(
        &self,
        order_id: &str,
        method: ValidationMethod,
    ) -> Result<bool, AuthorityError>;

    /// One status check, no retry
    async fn poll_status(&self, order_id: &str) -> Result<OrderStatus, AuthorityError>;

    /// Fetch the issued certificate and CA chain
    async fn download_bundle(&self, order_id: &str) -> Result<DownloadedBundle, AuthorityError>;

    /// Body of the most recent authority response, for diagnostics
    fn last_response(&self) -> Option<String> {
        None
    }
}

/// HTTP client for the authority API
pub struct AuthorityClient {
    http: reqwest::Client,
    api_base: String,
    access_key: String,
    strict_domains: bool,
    last_response: Mutex<Option<String>>,
}

impl AuthorityClient {
    /// Create a client for the API rooted at `api_base`
    pub fn new(
        api_base: &str,
        access_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AuthorityError> {
        // Validate the base early so every endpoint() call can assume it parses
        Url::parse(api_base)?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("certkeeper/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            access_key: access_key.into(),
            strict_domains: true,
            last_response: Mutex::new(None),
        })
    }

    /// Create a client from the authority configuration section
    pub fn from_config(config: &AuthorityConfig) -> Result<Self, AuthorityError> {
        let mut client = Self::new(
            &config.api_base,
            config.access_key.clone(),
            config.request_timeout(),
        )?;
        client.strict_domains = config.strict_domains;
        Ok(client)
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthorityError> {
        Ok(Url::parse(&format!("{}/{}", self.api_base, path))?)
    }

    /// Send a request and return status plus body text
    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<(StatusCode, String), AuthorityError> {
        let response = request
            .query(&[("access_key", self.access_key.as_str())])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        trace!(operation, status = %status, bytes = body.len(), "Authority response");
        *self.last_response.lock() = Some(body.clone());
        Ok((status, body))
    }

    /// Download bytes, recording only a summary as the last response
    async fn send_bytes(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<(StatusCode, Vec<u8>), AuthorityError> {
        let response = request
            .query(&[("access_key", self.access_key.as_str())])
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();

        trace!(operation, status = %status, bytes = body.len(), "Authority response");
        let summary = match std::str::from_utf8(&body) {
            Ok(text) => text.to_string(),
            Err(_) => format!("<{} bytes of binary data>", body.len()),
        };
        *self.last_response.lock() = Some(summary);
        Ok((status, body))
    }

    async fn download_json(&self, order_id: &str) -> Result<Option<DownloadedBundle>, AuthorityError> {
        let url = self.endpoint(&format!("certificates/{}/download/return", order_id))?;
        let (_, body) = self.send("download_json", self.http.get(url)).await?;
        Ok(parse_json(&body).and_then(|value| first_match(extract::CERTIFICATE_BUNDLE, &value, "")))
    }

    async fn download_archive(
        &self,
        order_id: &str,
    ) -> Result<Option<DownloadedBundle>, AuthorityError> {
        let url = self.endpoint(&format!("certificates/{}/download", order_id))?;
        let (status, body) = self.send_bytes("download_archive", self.http.get(url)).await?;
        if !status.is_success() {
            return Ok(None);
        }
        Ok(bundle_from_archive(&body))
    }
}

#[async_trait]
impl Authority for AuthorityClient {
    async fn create_order(
        &self,
        csr_pem: &str,
        domains: &str,
        validity_days: u32,
    ) -> Result<String, AuthorityError> {
        let url = self.endpoint("certificates")?;
        let validity = validity_days.to_string();
        let strict = if self.strict_domains { "1" } else { "0" };
        let form = [
            ("certificate_csr", csr_pem),
            ("certificate_domains", domains),
            ("certificate_validity_days", validity.as_str()),
            ("strict_domains", strict),
        ];

        debug!(domains = %domains, validity_days, "Creating certificate order");
        let (status, body) = self.send("create_order", self.http.post(url).form(&form)).await?;

        let order_id = parse_json(&body).and_then(|value| first_match(extract::ORDER_ID, &value, ""));
        match order_id {
            Some(id) => {
                debug!(order_id = %id, "Certificate order created");
                Ok(id)
            }
            None => {
                let reason = if body.trim().is_empty() {
                    format!("empty response (HTTP {})", status)
                } else {
                    body
                };
                Err(AuthorityError::OrderCreationFailed { reason })
            }
        }
    }

    async fn fetch_validation_token(
        &self,
        order_id: &str,
        identity: &str,
    ) -> Result<ChallengeToken, AuthorityError> {
        let url = self.endpoint(&format!("certificates/{}", order_id))?;
        let (_, body) = self.send("fetch_validation_token", self.http.get(url)).await?;

        parse_json(&body)
            .and_then(|value| first_match(extract::VALIDATION_TOKEN, &value, identity))
            .ok_or_else(|| AuthorityError::NoValidationInfo {
                order_id: order_id.to_string(),
                body: Some(body),
            })
    }

    async fn trigger_challenge(
        &self,
        order_id: &str,
        method: ValidationMethod,
    ) -> Result<bool, AuthorityError> {
        let url = self.endpoint(&format!("certificates/{}/challenges", order_id))?;
        let form = [("validation_method", method.as_str())];
        let (status, body) = self
            .send("trigger_challenge", self.http.post(url).form(&form))
            .await?;

        let acknowledged = status.is_success()
            && parse_json(&body).is_some_and(|value| {
                value.get("error").is_none()
                    && value.get("success").and_then(Value::as_bool) != Some(false)
            });
        Ok(acknowledged)
    }

    async fn poll_status(&self, order_id: &str) -> Result<OrderStatus, AuthorityError> {
        let url = self.endpoint(&format!("certificates/{}", order_id))?;
        let (_, body) = self.send("poll_status", self.http.get(url)).await?;

        let status = parse_json(&body)
            .as_ref()
            .and_then(extract::status)
            .map(OrderStatus::parse)
            .unwrap_or_else(|| OrderStatus::Unknown(String::new()));
        Ok(status)
    }

    async fn download_bundle(&self, order_id: &str) -> Result<DownloadedBundle, AuthorityError> {
        let json_body = match self.download_json(order_id).await {
            Ok(Some(bundle)) => return Ok(bundle),
            Ok(None) => self.last_response(),
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "JSON certificate download failed");
                None
            }
        };

        debug!(order_id = %order_id, "Falling back to archive download");
        match self.download_archive(order_id).await {
            Ok(Some(bundle)) => Ok(bundle),
            Ok(None) => Err(AuthorityError::DownloadFailed {
                order_id: order_id.to_string(),
                reason: "no non-empty leaf certificate in any download representation".to_string(),
                body: json_body,
            }),
            Err(e) => Err(AuthorityError::DownloadFailed {
                order_id: order_id.to_string(),
                reason: e.to_string(),
                body: json_body,
            }),
        }
    }

    fn last_response(&self) -> Option<String> {
        self.last_response.lock().clone()
    }
}

fn parse_json(body: &str) -> Option<Value> {
    if body.trim().is_empty() {
        return None;
    }
    serde_json::from_str(body).ok()
}

/// Extract leaf and chain from a zip, tar or gzip-compressed tar archive
pub fn bundle_from_archive(data: &[u8]) -> Option<DownloadedBundle> {
    if data.starts_with(&ZIP_MAGIC) {
        read_zip(data)
    } else if data.starts_with(&GZIP_MAGIC) {
        read_tar(tar::Archive::new(GzDecoder::new(data)))
    } else {
        read_tar(tar::Archive::new(data))
    }
}

fn read_zip(data: &[u8]) -> Option<DownloadedBundle> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).ok()?;
    let mut collected = ArchiveMembers::default();

    for index in 0..archive.len() {
        let mut file = archive.by_index(index).ok()?;
        if file.is_dir() {
            continue;
        }
        let name = member_name(Path::new(file.name()));
        if let Some(target) = collected.slot(name.as_deref()) {
            target.clear();
            file.read_to_string(target).ok()?;
        }
    }
    collected.into_bundle()
}

fn read_tar<R: Read>(mut archive: tar::Archive<R>) -> Option<DownloadedBundle> {
    let mut collected = ArchiveMembers::default();

    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        let name = member_name(&entry.path().ok()?);
        if let Some(target) = collected.slot(name.as_deref()) {
            target.clear();
            entry.read_to_string(target).ok()?;
        }
    }
    collected.into_bundle()
}

/// Leaf and chain text gathered from archive members
#[derive(Default)]
struct ArchiveMembers {
    leaf: String,
    chain: String,
}

impl ArchiveMembers {
    fn slot(&mut self, name: Option<&str>) -> Option<&mut String> {
        match name {
            Some(ARCHIVE_LEAF) => Some(&mut self.leaf),
            Some(ARCHIVE_CHAIN) => Some(&mut self.chain),
            _ => None,
        }
    }

    fn into_bundle(self) -> Option<DownloadedBundle> {
        if self.leaf.trim().is_empty() {
            return None;
        }
        Some(DownloadedBundle {
            leaf: self.leaf,
            chain: self.chain,
        })
    }
}

fn member_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}
