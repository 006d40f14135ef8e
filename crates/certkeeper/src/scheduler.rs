//! Renewal of an installed certificate
//!
//! Renewal reloads the persisted configuration on every check, so edits to
//! the file (a new credential, a different reload command) take effect
//! without restarting a long-running `watch`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use certkeeper_config::{ConfigError, Identity, IssuanceConfig};

use crate::hooks::{HookError, ReloadHook};
use crate::installer::ArtifactInstaller;
use crate::issuance::{
    ErrorCategory, InstallError, IssuanceError, IssuanceReport, IssuanceRequest, Orchestrator,
};

/// Default check interval (12 hours)
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 hour)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// A failed attempt together with what the authority last said
#[derive(Debug, Error)]
#[error("{error}")]
pub struct AttemptFailure {
    #[source]
    pub error: IssuanceError,
    pub last_response: Option<String>,
}

impl AttemptFailure {
    pub fn category(&self) -> ErrorCategory {
        self.error.category()
    }

    /// What the authority last said; falls back to the body carried by
    /// the error itself when no response was recorded
    pub fn authority_response(&self) -> Option<&str> {
        let recorded = self
            .last_response
            .as_deref()
            .filter(|body| !body.trim().is_empty());
        recorded.or(match &self.error {
            IssuanceError::Authority(e) => e.response_body(),
            _ => None,
        })
    }
}

impl From<IssuanceError> for AttemptFailure {
    fn from(error: IssuanceError) -> Self {
        Self {
            error,
            last_response: None,
        }
    }
}

impl From<ConfigError> for AttemptFailure {
    fn from(error: ConfigError) -> Self {
        IssuanceError::from(error).into()
    }
}

impl From<InstallError> for AttemptFailure {
    fn from(error: InstallError) -> Self {
        IssuanceError::from(error).into()
    }
}

/// Run one issuance attempt for `config`, without the reload hook
pub async fn issue_from_config(
    config: &IssuanceConfig,
    cancel: CancellationToken,
) -> Result<IssuanceReport, AttemptFailure> {
    let request = IssuanceRequest::from_config(config)?;
    let orchestrator = Orchestrator::from_config(config, cancel)?;

    orchestrator
        .issue(&request)
        .await
        .map_err(|error| AttemptFailure {
            error,
            last_response: orchestrator.last_response(),
        })
}

/// Result of one renewal check
#[derive(Debug)]
pub enum RenewalOutcome {
    /// The installed certificate is still good
    NotDue { expires: Option<DateTime<Utc>> },
    /// A new certificate was installed; `reload` is the hook result if one
    /// is configured
    Renewed {
        report: IssuanceReport,
        reload: Option<Result<(), HookError>>,
    },
}

/// Checks the installed certificate and renews it when needed
pub struct RenewalScheduler {
    config_path: PathBuf,
    check_interval: Duration,
    cancel: CancellationToken,
}

impl RenewalScheduler {
    pub fn new(config_path: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            config_path: config_path.into(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            cancel,
        }
    }

    /// Set the check interval
    ///
    /// The interval is clamped to a minimum of 1 hour.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run renewal checks until cancelled
    pub async fn run(self) {
        info!(
            config = %self.config_path.display(),
            check_interval_hours = self.check_interval.as_secs() / 3600,
            "Starting certificate renewal scheduler"
        );

        let mut interval = interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            debug!("Running scheduled certificate renewal check");

            match self.run_once(false).await {
                Ok(RenewalOutcome::NotDue { expires }) => {
                    debug!(expires = ?expires, "Certificate is still valid");
                }
                Ok(RenewalOutcome::Renewed { report, .. }) => {
                    info!(order_id = %report.order_id, "Certificate renewed");
                }
                Err(failure) if failure.category() == ErrorCategory::Cancelled => break,
                Err(failure) => {
                    // Retried on the next tick
                    error!(
                        category = %failure.category(),
                        error = %failure.error,
                        last_response = failure.last_response.as_deref().unwrap_or(""),
                        "Certificate renewal failed"
                    );
                }
            }
        }

        info!("Certificate renewal scheduler stopped");
    }

    /// Reload the configuration and renew if due (or if `force`)
    pub async fn run_once(&self, force: bool) -> Result<RenewalOutcome, AttemptFailure> {
        let config = IssuanceConfig::load(&self.config_path)?;
        let identity = config.identity()?;
        let installer = ArtifactInstaller::new(&config.install.live_dir);

        if !force && !renewal_due(&installer, &identity, config.install.renew_before_days)? {
            return Ok(RenewalOutcome::NotDue {
                expires: installer.installed_expiry()?,
            });
        }

        info!(identity = %identity, force, "Certificate needs renewal");
        let report = issue_from_config(&config, self.cancel.clone()).await?;
        let reload = run_reload_hook(&config).await;

        Ok(RenewalOutcome::Renewed { report, reload })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("config_path", &self.config_path)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

/// Run the configured reload command, if any; failures are logged
pub async fn run_reload_hook(config: &IssuanceConfig) -> Option<Result<(), HookError>> {
    let hook = match ReloadHook::from_config(config.install.reload_command.as_ref()) {
        Ok(Some(hook)) => hook,
        Ok(None) => return None,
        Err(e) => return Some(Err(e)),
    };

    let result = hook.run().await;
    if let Err(e) = &result {
        error!(error = %e, "Certificate installed but reload command failed");
    }
    Some(result)
}

/// Whether the live certificate must be replaced for `identity`
fn renewal_due(
    installer: &ArtifactInstaller,
    identity: &Identity,
    renew_before_days: u32,
) -> Result<bool, InstallError> {
    if let Some(meta) = installer.load_meta()? {
        if meta.identity != identity.value() {
            warn!(
                installed = %meta.identity,
                configured = %identity,
                "Installed certificate is for a different identity"
            );
            return Ok(true);
        }
    }
    installer.needs_renewal(renew_before_days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::tests::self_signed;
    use crate::installer::{CertificateBundle, CertificateMeta};
    use crate::issuance::AuthorityError;
    use tempfile::TempDir;

    fn write_config(dir: &Path, live: &Path) -> PathBuf {
        let path = dir.join("certkeeper.toml");
        let content = format!(
            r#"
[identity]
value = "example.com"

[authority]
api-base = "http://127.0.0.1:9"
access-key = "test-key"
request-timeout-secs = 2

[challenge]
bind = "127.0.0.1:0"

[install]
live-dir = "{}"
"#,
            live.display()
        );
        std::fs::write(&path, content).unwrap();
        path
    }

    fn install(live: &Path, identity: &str, year: i32) {
        let pem = self_signed(identity, year);
        ArtifactInstaller::new(live)
            .install(
                &CertificateBundle::new("KEY", pem.clone(), ""),
                &CertificateMeta::new(identity, "order", &pem),
            )
            .unwrap();
    }

    #[test]
    fn test_interval_clamped() {
        let scheduler = RenewalScheduler::new("c.toml", CancellationToken::new());
        assert_eq!(scheduler.check_interval(), DEFAULT_CHECK_INTERVAL);

        let scheduler = scheduler.with_interval(Duration::from_secs(60));
        assert_eq!(scheduler.check_interval(), MIN_CHECK_INTERVAL);
    }

    #[test]
    fn test_authority_response_fallback() {
        let rejection = r#"{"success":false}"#;
        let error = || {
            IssuanceError::from(AuthorityError::OrderCreationFailed {
                reason: rejection.to_string(),
            })
        };

        let failure = AttemptFailure::from(error());
        assert_eq!(failure.authority_response(), Some(rejection));

        let failure = AttemptFailure {
            error: error(),
            last_response: Some("  ".to_string()),
        };
        assert_eq!(failure.authority_response(), Some(rejection));

        let failure = AttemptFailure {
            error: error(),
            last_response: Some("recorded".to_string()),
        };
        assert_eq!(failure.authority_response(), Some("recorded"));

        let failure = AttemptFailure::from(IssuanceError::Cancelled);
        assert_eq!(failure.authority_response(), None);
    }

    #[test]
    fn test_renewal_due_on_identity_change() {
        let temp_dir = TempDir::new().unwrap();
        install(temp_dir.path(), "old.example.com", 2090);
        let installer = ArtifactInstaller::new(temp_dir.path());

        let same = Identity::domain("old.example.com").unwrap();
        let other = Identity::domain("new.example.com").unwrap();
        assert!(!renewal_due(&installer, &same, 30).unwrap());
        assert!(renewal_due(&installer, &other, 30).unwrap());
    }

    #[tokio::test]
    async fn test_not_due_skips_authority() {
        let temp_dir = TempDir::new().unwrap();
        let live = temp_dir.path().join("live");
        install(&live, "example.com", 2090);
        let config = write_config(temp_dir.path(), &live);

        let scheduler = RenewalScheduler::new(config, CancellationToken::new());
        match scheduler.run_once(false).await.unwrap() {
            RenewalOutcome::NotDue { expires } => assert!(expires.is_some()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forced_renewal_reports_authority_failure() {
        let temp_dir = TempDir::new().unwrap();
        let live = temp_dir.path().join("live");
        install(&live, "example.com", 2090);
        let config = write_config(temp_dir.path(), &live);

        let scheduler = RenewalScheduler::new(config, CancellationToken::new());
        let failure = scheduler.run_once(true).await.unwrap_err();
        assert_eq!(failure.category(), ErrorCategory::Authority);
    }

    #[tokio::test]
    async fn test_missing_config_is_configuration_error() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler =
            RenewalScheduler::new(temp_dir.path().join("missing.toml"), CancellationToken::new());

        let failure = scheduler.run_once(false).await.unwrap_err();
        assert_eq!(failure.category(), ErrorCategory::Configuration);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let scheduler = RenewalScheduler::new(temp_dir.path().join("missing.toml"), cancel);
        tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .unwrap();
    }
}
