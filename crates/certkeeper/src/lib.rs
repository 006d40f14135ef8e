//! certkeeper library
//!
//! Obtains and renews TLS certificates for a single domain or bare IP
//! address from an authority that validates control with an HTTP file
//! challenge, and installs them into a live directory under fixed names.
//!
//! - **Issuance**: key/CSR generation, authority client, challenge
//!   publication and the per-attempt state machine ([`issuance`])
//! - **Installation**: atomic replacement of the live key and certificates
//!   ([`installer`])
//! - **Renewal**: reload of persisted configuration and periodic checks
//!   ([`scheduler`]), with an optional post-install command ([`hooks`])
//!
//! # Example
//!
//! ```ignore
//! use certkeeper::scheduler::issue_from_config;
//! use certkeeper_config::IssuanceConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = IssuanceConfig::load(Path::new("/etc/certkeeper/certkeeper.toml"))?;
//! let report = issue_from_config(&config, CancellationToken::new()).await?;
//! println!("installed {}", report.paths.fullchain.display());
//! ```

pub mod hooks;
pub mod installer;
pub mod issuance;
pub mod scheduler;

pub use installer::{ArtifactInstaller, CertificateBundle, CertificateMeta, InstalledPaths};
pub use issuance::{ErrorCategory, IssuanceError, IssuanceReport, IssuanceRequest, Orchestrator};
pub use scheduler::{issue_from_config, AttemptFailure, RenewalOutcome, RenewalScheduler};
