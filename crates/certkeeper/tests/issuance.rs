//! End-to-end issuance against a mocked authority.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use certkeeper::installer::ArtifactInstaller;
use certkeeper::issuance::{
    AuthorityClient, ChallengePublisher, ErrorCategory, IssuanceError, IssuanceRequest,
    Orchestrator, PollSettings,
};
use certkeeper_config::{Identity, KeySpec};

const ACCESS_KEY: &str = "e2e-access-key";
const ORDER_ID: &str = "abc123";
const IDENTITY: &str = "203.0.113.10";
const TOKEN_PATH: &str = "/.well-known/pki-validation/XYZ";
const TOKEN_CONTENT: &str = "hello-token";
const CHAIN: &str = "-----BEGIN CERTIFICATE-----\nCHAIN\n-----END CERTIFICATE-----\n";

/// Order detail endpoint: first call serves the token, later calls walk
/// through `statuses`. Records whether the challenge file was in place at
/// each status check.
#[derive(Clone)]
struct OrderDetail {
    calls: Arc<AtomicUsize>,
    statuses: Vec<&'static str>,
    webroot: Option<PathBuf>,
    challenge_seen: Arc<Mutex<Vec<bool>>>,
}

impl OrderDetail {
    fn new(statuses: &[&'static str], webroot: Option<&Path>) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            statuses: statuses.to_vec(),
            webroot: webroot.map(Path::to_path_buf),
            challenge_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}

impl Respond for OrderDetail {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let status = match call {
            0 => "draft",
            n => self
                .statuses
                .get(n - 1)
                .copied()
                .unwrap_or("pending_validation"),
        };

        if call > 0 {
            if let Some(webroot) = &self.webroot {
                let file = webroot.join(TOKEN_PATH.trim_start_matches('/'));
                let served = std::fs::read_to_string(file).ok();
                self.challenge_seen
                    .lock()
                    .push(served.as_deref() == Some(TOKEN_CONTENT));
            }
        }

        ResponseTemplate::new(200).set_body_json(json!({
            "id": ORDER_ID,
            "status": status,
            "validation": {
                "other_methods": {
                    IDENTITY: {
                        "file_validation_url_http": format!("http://{}{}", IDENTITY, TOKEN_PATH),
                        "file_validation_path": TOKEN_PATH,
                        "file_validation_content": TOKEN_CONTENT
                    }
                }
            }
        }))
    }
}

/// Download endpoint returning a freshly generated leaf on every call
#[derive(Clone, Default)]
struct Download {
    leaves: Arc<Mutex<Vec<String>>>,
}

impl Respond for Download {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let leaf = self_signed_leaf();
        self.leaves.lock().push(leaf.clone());
        ResponseTemplate::new(200).set_body_json(json!({
            "certificate.crt": leaf,
            "ca_bundle.crt": CHAIN
        }))
    }
}

fn self_signed_leaf() -> String {
    let params = rcgen::CertificateParams::new(vec![IDENTITY.to_string()]).unwrap();
    let key = rcgen::KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().pem()
}

async fn mount_order_flow(server: &MockServer, detail: OrderDetail, download: Download) {
    Mock::given(method("POST"))
        .and(path("/certificates"))
        .and(query_param("access_key", ACCESS_KEY))
        .and(body_string_contains("certificate_domains=203.0.113.10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": ORDER_ID })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/certificates/{}", ORDER_ID)))
        .and(query_param("access_key", ACCESS_KEY))
        .respond_with(detail)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("/certificates/{}/challenges", ORDER_ID)))
        .and(body_string_contains("validation_method=HTTP_CSR_HASH"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": ORDER_ID })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/certificates/{}/download/return", ORDER_ID)))
        .respond_with(download)
        .mount(server)
        .await;
}

fn settings() -> PollSettings {
    PollSettings {
        interval: Duration::from_millis(10),
        max_attempts: 10,
        token_attempts: 2,
        token_retry_delay: Duration::from_millis(10),
    }
}

fn request() -> IssuanceRequest {
    IssuanceRequest {
        identity: Identity::ip(IDENTITY).unwrap(),
        key_spec: KeySpec::default(),
        validity_days: 90,
    }
}

fn orchestrator(
    server: &MockServer,
    publisher: ChallengePublisher,
    live: &Path,
    work: &Path,
) -> Orchestrator<AuthorityClient, ChallengePublisher> {
    let client = AuthorityClient::new(&server.uri(), ACCESS_KEY, Duration::from_secs(5)).unwrap();
    Orchestrator::new(
        client,
        publisher,
        ArtifactInstaller::new(live),
        settings(),
        CancellationToken::new(),
    )
    .with_work_dir(work)
}

fn loopback() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn is_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

#[tokio::test]
async fn test_ip_identity_end_to_end() {
    let server = MockServer::start().await;
    let webroot = TempDir::new().unwrap();
    let live = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();

    let detail = OrderDetail::new(&["pending", "pending", "issued"], Some(webroot.path()));
    let download = Download::default();
    mount_order_flow(&server, detail.clone(), download.clone()).await;

    let publisher = ChallengePublisher::new(Some(webroot.path().to_path_buf()), loopback());
    let orchestrator = orchestrator(&server, publisher, live.path(), work.path());

    let report = orchestrator.issue(&request()).await.unwrap();

    assert_eq!(report.order_id, ORDER_ID);
    assert_eq!(report.identity.value(), IDENTITY);
    assert_eq!(report.poll_attempts, 3);
    assert!(report.expires_at.is_some());

    // Token fetch plus exactly three status checks
    assert_eq!(detail.calls.load(Ordering::SeqCst), 4);
    assert_eq!(*detail.challenge_seen.lock(), vec![true, true, true]);
    assert!(!webroot.path().join(".well-known").exists());

    let leaf = download.leaves.lock()[0].clone();
    let paths = &report.paths;
    assert_eq!(paths.private_key, live.path().join("private.key"));
    assert_eq!(std::fs::read_to_string(&paths.certificate).unwrap(), leaf);
    assert_eq!(std::fs::read_to_string(&paths.ca_bundle).unwrap(), CHAIN);
    assert_eq!(
        std::fs::read_to_string(&paths.fullchain).unwrap(),
        format!("{}{}", leaf, CHAIN)
    );
    assert!(std::fs::read_to_string(&paths.private_key)
        .unwrap()
        .contains("PRIVATE KEY"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&paths.private_key)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    assert!(is_empty_dir(work.path()));
}

#[tokio::test]
async fn test_order_without_id_fails_before_publishing() {
    let server = MockServer::start().await;
    let webroot = TempDir::new().unwrap();
    let live = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let rejection = r#"{"success":false,"error":{"code":2817,"type":"invalid_certificate_csr"}}"#;

    Mock::given(method("POST"))
        .and(path("/certificates"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rejection))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let publisher = ChallengePublisher::new(Some(webroot.path().to_path_buf()), loopback());
    let orchestrator = orchestrator(&server, publisher, live.path(), work.path());

    let err = orchestrator.issue(&request()).await.unwrap_err();

    assert!(matches!(err, IssuanceError::Authority(_)));
    assert_eq!(err.category(), ErrorCategory::Authority);
    assert_eq!(orchestrator.last_response().as_deref(), Some(rejection));
    assert!(is_empty_dir(webroot.path()));
    assert!(is_empty_dir(live.path()));
    assert!(is_empty_dir(work.path()));
}

#[tokio::test]
async fn test_reissue_replaces_previous_bundle() {
    let server = MockServer::start().await;
    let live = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();

    let detail = OrderDetail::new(&["issued"], None);
    let download = Download::default();
    mount_order_flow(&server, detail.clone(), download.clone()).await;

    // Temporary server mode, challenge roots under the work dir
    let publisher = ChallengePublisher::new(None, loopback()).with_temp_parent(work.path());
    let orchestrator = orchestrator(&server, publisher, live.path(), work.path());

    let first = orchestrator.issue(&request()).await.unwrap();
    let first_key = std::fs::read_to_string(&first.paths.private_key).unwrap();

    detail.reset();
    let second = orchestrator.issue(&request()).await.unwrap();
    let second_key = std::fs::read_to_string(&second.paths.private_key).unwrap();

    let leaves = download.leaves.lock().clone();
    assert_eq!(leaves.len(), 2);
    assert_ne!(first_key, second_key);
    assert_eq!(
        std::fs::read_to_string(&second.paths.certificate).unwrap(),
        leaves[1]
    );
    assert_eq!(
        std::fs::read_to_string(&second.paths.fullchain).unwrap(),
        format!("{}{}", leaves[1], CHAIN)
    );

    // One live bundle, no attempt or challenge directories left behind
    let bundles = std::fs::read_dir(live.path().join(".bundles")).unwrap().count();
    assert_eq!(bundles, 1);
    assert!(is_empty_dir(work.path()));

    let meta = ArtifactInstaller::new(live.path()).load_meta().unwrap().unwrap();
    assert_eq!(meta.identity, IDENTITY);
    assert_eq!(meta.order_id, ORDER_ID);
}
