//! Certificate issuance via HTTP file validation
//!
//! Obtains a certificate for a single domain or bare IP address from an
//! authority with a ZeroSSL-style REST API.
//!
//! # Architecture
//!
//! - [`keys`] - Private key and CSR generation
//! - [`AuthorityClient`] - Typed client for the authority's HTTP/JSON API
//! - [`ChallengePublisher`] - Makes the validation file reachable on port 80
//! - [`Orchestrator`] - The per-attempt state machine tying them together
//!
//! [`Authority`] and [`Publisher`] are the seams the orchestrator is written
//! against, so the whole flow can run against in-process fakes.
//!
//! # Challenge Flow
//!
//! 1. A fresh key and a CSR naming the identity are generated
//! 2. [`AuthorityClient`] creates an order for the CSR
//! 3. The order's file-validation token is fetched
//! 4. [`ChallengePublisher`] writes the token under a web root or serves it
//!    from a temporary server
//! 5. Validation is triggered and the order status polled until `issued`
//! 6. The challenge is unpublished
//! 7. The certificate is downloaded and installed by
//!    [`ArtifactInstaller`](crate::installer::ArtifactInstaller)

mod challenge;
mod client;
mod error;
mod extract;
pub mod keys;
mod orchestrator;
mod order;

pub use challenge::{ChallengePublisher, PublishedChallenge, Publisher};
pub use client::{bundle_from_archive, Authority, AuthorityClient};
pub use error::{
    AuthorityError, ErrorCategory, InstallError, IssuanceError, KeyError, PublishError,
};
pub use orchestrator::{
    AttemptState, IssuanceReport, IssuanceRequest, Orchestrator, PollSettings,
};
pub use order::{ChallengeToken, DownloadedBundle, OrderStatus, ValidationMethod};
