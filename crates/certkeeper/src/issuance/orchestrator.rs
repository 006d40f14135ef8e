//! Issuance state machine
//!
//! One attempt walks
//! `Init → KeyGenerated → OrderCreated → ChallengeReady → ChallengePublished
//! → ValidationTriggered → Polling → Issued | Failed`. Every attempt starts a
//! fresh order with a fresh key; there is no resume.
//!
//! Once a challenge is published it is unpublished exactly once, whatever
//! happens while validating, before the attempt moves on or fails.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use certkeeper_config::{Identity, IssuanceConfig, KeySpec, PollingConfig};

use super::challenge::{ChallengePublisher, Publisher};
use super::client::{Authority, AuthorityClient};
use super::error::IssuanceError;
use super::keys;
use super::order::{ChallengeToken, OrderStatus, ValidationMethod};
use crate::installer::{ArtifactInstaller, CertificateBundle, CertificateMeta, InstalledPaths};

/// Retry and polling cadence
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Pause between status checks
    pub interval: Duration,
    /// Status checks before the attempt times out
    pub max_attempts: u32,
    /// Tries at fetching the validation token
    pub token_attempts: u32,
    /// Pause between token fetches
    pub token_retry_delay: Duration,
}

impl From<&PollingConfig> for PollSettings {
    fn from(config: &PollingConfig) -> Self {
        Self {
            interval: config.interval(),
            max_attempts: config.max_attempts,
            token_attempts: config.token_attempts,
            token_retry_delay: config.token_retry_delay(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

/// What to issue
#[derive(Debug, Clone)]
pub struct IssuanceRequest {
    /// Name the certificate is bound to
    pub identity: Identity,
    /// Algorithm of the fresh private key
    pub key_spec: KeySpec,
    /// Requested lifetime in days
    pub validity_days: u32,
}

impl IssuanceRequest {
    pub fn from_config(config: &IssuanceConfig) -> Result<Self, IssuanceError> {
        Ok(Self {
            identity: config.identity()?,
            key_spec: config.key.spec.clone(),
            validity_days: config.authority.validity_days,
        })
    }
}

/// Progress of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Init,
    KeyGenerated,
    OrderCreated,
    ChallengeReady,
    ChallengePublished,
    ValidationTriggered,
    Polling,
    Issued,
    Failed,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::Init => "init",
            AttemptState::KeyGenerated => "key_generated",
            AttemptState::OrderCreated => "order_created",
            AttemptState::ChallengeReady => "challenge_ready",
            AttemptState::ChallengePublished => "challenge_published",
            AttemptState::ValidationTriggered => "validation_triggered",
            AttemptState::Polling => "polling",
            AttemptState::Issued => "issued",
            AttemptState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State owned by one attempt; the working directory goes with it
struct AttemptContext {
    identity: Identity,
    work_dir: TempDir,
    state: AttemptState,
    order_id: Option<String>,
}

impl AttemptContext {
    fn new(identity: Identity, work_dir: TempDir) -> Self {
        Self {
            identity,
            work_dir,
            state: AttemptState::Init,
            order_id: None,
        }
    }

    fn transition(&mut self, to: AttemptState) {
        debug!(
            identity = %self.identity,
            order_id = self.order_id.as_deref().unwrap_or("-"),
            from = %self.state,
            to = %to,
            "Issuance state transition"
        );
        self.state = to;
    }
}

/// Outcome of a successful attempt
#[derive(Debug, Clone)]
pub struct IssuanceReport {
    pub identity: Identity,
    /// Authority order that produced the certificate
    pub order_id: String,
    /// Live paths of the installed artifacts
    pub paths: InstalledPaths,
    /// Leaf `notAfter`, when the leaf could be parsed
    pub expires_at: Option<DateTime<Utc>>,
    /// Status checks it took to see `issued`
    pub poll_attempts: u32,
}

/// Drives issuance attempts against an authority
pub struct Orchestrator<A, P> {
    authority: A,
    publisher: P,
    installer: ArtifactInstaller,
    settings: PollSettings,
    work_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl Orchestrator<AuthorityClient, ChallengePublisher> {
    /// Orchestrator wired to the real authority client and publisher
    pub fn from_config(
        config: &IssuanceConfig,
        cancel: CancellationToken,
    ) -> Result<Self, IssuanceError> {
        let authority = AuthorityClient::from_config(&config.authority)?;

        let mut publisher =
            ChallengePublisher::new(config.challenge.webroot.clone(), config.challenge.bind);
        if let Some(dir) = &config.install.work_dir {
            publisher = publisher.with_temp_parent(dir);
        }

        let mut orchestrator = Self::new(
            authority,
            publisher,
            ArtifactInstaller::new(&config.install.live_dir),
            PollSettings::from(&config.polling),
            cancel,
        );
        orchestrator.work_dir = config.install.work_dir.clone();
        Ok(orchestrator)
    }
}

impl<A: Authority, P: Publisher> Orchestrator<A, P> {
    pub fn new(
        authority: A,
        publisher: P,
        installer: ArtifactInstaller,
        settings: PollSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            authority,
            publisher,
            installer,
            settings,
            work_dir: None,
            cancel,
        }
    }

    /// Create per-attempt working directories under `dir`
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn authority(&self) -> &A {
        &self.authority
    }

    pub fn installer(&self) -> &ArtifactInstaller {
        &self.installer
    }

    /// Body of the most recent authority response
    pub fn last_response(&self) -> Option<String> {
        self.authority.last_response()
    }

    /// Run one complete issuance attempt
    pub async fn issue(&self, request: &IssuanceRequest) -> Result<IssuanceReport, IssuanceError> {
        let start = Instant::now();
        let mut ctx = AttemptContext::new(request.identity.clone(), self.attempt_dir()?);

        info!(
            identity = %request.identity,
            kind = %request.identity.kind(),
            key_spec = %request.key_spec,
            "Starting certificate issuance"
        );

        match self.attempt(&mut ctx, request).await {
            Ok(report) => {
                info!(
                    identity = %report.identity,
                    order_id = %report.order_id,
                    poll_attempts = report.poll_attempts,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Certificate issued and installed"
                );
                Ok(report)
            }
            Err(e) => {
                let failed_in = ctx.state;
                ctx.transition(AttemptState::Failed);
                error!(
                    identity = %ctx.identity,
                    order_id = ctx.order_id.as_deref().unwrap_or("-"),
                    state = %failed_in,
                    category = %e.category(),
                    error = %e,
                    "Certificate issuance failed"
                );
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        ctx: &mut AttemptContext,
        request: &IssuanceRequest,
    ) -> Result<IssuanceReport, IssuanceError> {
        if self.cancel.is_cancelled() {
            return Err(IssuanceError::Cancelled);
        }

        let (key, csr) = keys::generate(&ctx.identity, &request.key_spec)?;
        keys::write_to(ctx.work_dir.path(), &key, &csr)?;
        ctx.transition(AttemptState::KeyGenerated);

        let order_id = self
            .cancellable(self.authority.create_order(
                csr.pem(),
                ctx.identity.value(),
                request.validity_days,
            ))
            .await?;
        ctx.order_id = Some(order_id.clone());
        ctx.transition(AttemptState::OrderCreated);

        let token = self.fetch_token(&order_id, ctx.identity.value()).await?;
        debug!(
            order_id = %order_id,
            path = %token.relative_path,
            verification_url = %token.verification_url,
            "Validation token received"
        );
        ctx.transition(AttemptState::ChallengeReady);

        let published = self.publisher.publish(&token).await?;
        ctx.transition(AttemptState::ChallengePublished);

        let validated = self.validate(ctx, &order_id).await;
        self.publisher.unpublish(published).await;
        let poll_attempts = validated?;
        ctx.transition(AttemptState::Issued);

        let downloaded = self
            .cancellable(self.authority.download_bundle(&order_id))
            .await?;
        let bundle = CertificateBundle::new(key.private_key_pem(), downloaded.leaf, downloaded.chain);
        let meta = CertificateMeta::new(ctx.identity.to_string(), order_id.clone(), bundle.leaf_pem());
        let paths = self.installer.install(&bundle, &meta)?;

        Ok(IssuanceReport {
            identity: ctx.identity.clone(),
            order_id,
            paths,
            expires_at: meta.expires,
            poll_attempts,
        })
    }

    /// Fetch the validation token, retrying a bounded number of times
    async fn fetch_token(
        &self,
        order_id: &str,
        identity: &str,
    ) -> Result<ChallengeToken, IssuanceError> {
        let attempts = self.settings.token_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self
                .cancellable(self.authority.fetch_validation_token(order_id, identity))
                .await
            {
                Ok(token) => return Ok(token),
                Err(IssuanceError::Cancelled) => return Err(IssuanceError::Cancelled),
                Err(e) if attempt < attempts => {
                    warn!(
                        order_id = %order_id,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Validation token not available yet, retrying"
                    );
                    attempt += 1;
                    self.pause(self.settings.token_retry_delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Trigger validation and poll; returns the number of status checks used
    async fn validate(
        &self,
        ctx: &mut AttemptContext,
        order_id: &str,
    ) -> Result<u32, IssuanceError> {
        match self
            .cancellable(
                self.authority
                    .trigger_challenge(order_id, ValidationMethod::HttpCsrHash),
            )
            .await
        {
            Ok(true) => debug!(order_id = %order_id, "Validation triggered"),
            Ok(false) => warn!(
                order_id = %order_id,
                "Authority did not acknowledge the validation trigger, polling anyway"
            ),
            Err(IssuanceError::Cancelled) => return Err(IssuanceError::Cancelled),
            Err(e) => warn!(
                order_id = %order_id,
                error = %e,
                "Validation trigger failed, polling anyway"
            ),
        }
        ctx.transition(AttemptState::ValidationTriggered);

        ctx.transition(AttemptState::Polling);
        self.poll_until_issued(order_id).await
    }

    async fn poll_until_issued(&self, order_id: &str) -> Result<u32, IssuanceError> {
        let max_attempts = self.settings.max_attempts;

        for attempt in 1..=max_attempts {
            let status = match self.cancellable(self.authority.poll_status(order_id)).await {
                Ok(status) => status,
                Err(IssuanceError::Cancelled) => return Err(IssuanceError::Cancelled),
                Err(e) => {
                    warn!(order_id = %order_id, attempt, error = %e, "Status check failed");
                    OrderStatus::Unknown(String::new())
                }
            };

            debug!(order_id = %order_id, attempt, max_attempts, status = %status, "Order status");

            if status == OrderStatus::Issued {
                return Ok(attempt);
            }
            if status.is_terminal_failure() {
                return Err(IssuanceError::OrderFailed {
                    order_id: order_id.to_string(),
                    status: status.to_string(),
                });
            }
            if attempt < max_attempts {
                self.pause(self.settings.interval).await?;
            }
        }

        Err(IssuanceError::ValidationTimeout {
            order_id: order_id.to_string(),
            attempts: max_attempts,
        })
    }

    async fn cancellable<T, E>(
        &self,
        operation: impl Future<Output = Result<T, E>>,
    ) -> Result<T, IssuanceError>
    where
        IssuanceError: From<E>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IssuanceError::Cancelled),
            result = operation => Ok(result?),
        }
    }

    async fn pause(&self, duration: Duration) -> Result<(), IssuanceError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(IssuanceError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn attempt_dir(&self) -> Result<TempDir, IssuanceError> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("certkeeper-attempt-");
            builder
        };
        match &self.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(IssuanceError::WorkDir)?;
                builder.tempdir_in(dir).map_err(IssuanceError::WorkDir)
            }
            None => builder.tempdir().map_err(IssuanceError::WorkDir),
        }
    }
}
