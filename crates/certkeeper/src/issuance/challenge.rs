//! HTTP file-validation challenge publication
//!
//! The authority validates control of an identity by fetching a small file
//! over plain HTTP at a well-known path. The file is either written into an
//! existing web root served by the operator's own web server, or served by a
//! temporary server that lives only for the attempt.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use super::error::PublishError;
use super::order::ChallengeToken;

/// How long `unpublish` waits for the temporary server to wind down
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Makes a challenge token reachable by the authority
///
/// `unpublish` consumes the handle, so a published challenge is released at
/// most once.
#[async_trait]
pub trait Publisher: Send + Sync {
    type Handle: Send;

    async fn publish(&self, token: &ChallengeToken) -> Result<Self::Handle, PublishError>;

    async fn unpublish(&self, handle: Self::Handle);
}

/// Publishes challenge files to a web root or a temporary HTTP server
#[derive(Debug, Clone)]
pub struct ChallengePublisher {
    webroot: Option<PathBuf>,
    bind: SocketAddr,
    temp_parent: Option<PathBuf>,
}

impl ChallengePublisher {
    /// Publisher writing into an existing web root, or serving on `bind`
    /// when `webroot` is `None`
    pub fn new(webroot: Option<PathBuf>, bind: SocketAddr) -> Self {
        Self {
            webroot,
            bind,
            temp_parent: None,
        }
    }

    /// Create temporary serving roots under `dir` instead of the system
    /// temp directory
    pub fn with_temp_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_parent = Some(dir.into());
        self
    }

    async fn publish_to_webroot(
        &self,
        root: &Path,
        token: &ChallengeToken,
    ) -> Result<PublishedChallenge, PublishError> {
        let file = resolve_path(root, &token.relative_path)?;
        let created_dirs = create_parents(root, &file)?;
        write_file(&file, &token.content)?;

        info!(
            path = %file.display(),
            "Challenge file written to web root"
        );

        Ok(PublishedChallenge {
            file: Some(file),
            created_dirs,
            temp_dir: None,
            server: None,
        })
    }

    async fn publish_with_server(
        &self,
        token: &ChallengeToken,
    ) -> Result<PublishedChallenge, PublishError> {
        let temp_dir = match &self.temp_parent {
            Some(parent) => tempfile::Builder::new()
                .prefix("challenge-")
                .tempdir_in(parent)?,
            None => tempfile::Builder::new().prefix("certkeeper-challenge-").tempdir()?,
        };
        let root = temp_dir.path().to_path_buf();

        let file = resolve_path(&root, &token.relative_path)?;
        create_parents(&root, &file)?;
        write_file(&file, &token.content)?;

        let listener = TcpListener::bind(self.bind)
            .await
            .map_err(|e| bind_error(self.bind, e))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(serve(listener, Arc::new(root), shutdown_rx));

        info!(
            addr = %local_addr,
            path = %token.relative_path,
            "Temporary challenge server started"
        );

        Ok(PublishedChallenge {
            file: Some(file),
            created_dirs: Vec::new(),
            temp_dir: Some(temp_dir),
            server: Some(ChallengeServer {
                local_addr,
                shutdown: Some(shutdown_tx),
                task,
            }),
        })
    }
}

#[async_trait]
impl Publisher for ChallengePublisher {
    type Handle = PublishedChallenge;

    async fn publish(&self, token: &ChallengeToken) -> Result<PublishedChallenge, PublishError> {
        match &self.webroot {
            Some(root) => self.publish_to_webroot(root, token).await,
            None => self.publish_with_server(token).await,
        }
    }

    async fn unpublish(&self, mut handle: PublishedChallenge) {
        if let Some(server) = handle.server.take() {
            server.stop().await;
        }
        handle.remove_files();
        debug!("Challenge unpublished");
    }
}

/// A live challenge
///
/// Dropping it without `unpublish` still stops the server and removes what
/// `publish` created.
#[derive(Debug)]
pub struct PublishedChallenge {
    file: Option<PathBuf>,
    /// Directories created under a web root, deepest last
    created_dirs: Vec<PathBuf>,
    temp_dir: Option<TempDir>,
    server: Option<ChallengeServer>,
}

impl PublishedChallenge {
    /// Path of the published file
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Address of the temporary server, if one is running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr)
    }

    fn remove_files(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = std::fs::remove_file(&file) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %file.display(), error = %e, "Failed to remove challenge file");
                }
            }
        }

        for dir in self.created_dirs.drain(..).rev() {
            // Only empty directories go; anything else belongs to someone else now
            if std::fs::remove_dir(&dir).is_err() {
                trace!(path = %dir.display(), "Leaving non-empty challenge directory");
            }
        }

        if let Some(temp_dir) = self.temp_dir.take() {
            let path = temp_dir.path().to_path_buf();
            if let Err(e) = temp_dir.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove challenge directory");
            }
        }
    }
}

impl Drop for PublishedChallenge {
    fn drop(&mut self) {
        if let Some(mut server) = self.server.take() {
            warn!(addr = %server.local_addr, "Challenge dropped without unpublish, aborting server");
            server.abort();
        }
        self.remove_files();
    }
}

#[derive(Debug)]
struct ChallengeServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ChallengeServer {
    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, &mut self.task).await {
            Ok(_) => debug!(addr = %self.local_addr, "Temporary challenge server stopped"),
            Err(_) => {
                warn!(addr = %self.local_addr, "Challenge server did not stop in time, aborting");
                self.task.abort();
            }
        }
    }

    fn abort(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

/// Accept loop of the temporary server
///
/// On shutdown every accepted connection is aborted along with the listener.
async fn serve(listener: TcpListener, root: Arc<PathBuf>, mut shutdown: oneshot::Receiver<()>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(peer = %peer, "Challenge connection accepted");
                    let root = Arc::clone(&root);
                    connections.spawn(async move {
                        let service = service_fn(move |req| handle(req, Arc::clone(&root)));
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(peer = %peer, error = %e, "Challenge connection error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept challenge connection"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
}

async fn handle(
    req: Request<Incoming>,
    root: Arc<PathBuf>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    debug!(method = %req.method(), path = %path, "Challenge request");

    if req.method() != Method::GET && req.method() != Method::HEAD {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
    }

    let Ok(file) = resolve_path(&root, path) else {
        return Ok(status_response(StatusCode::NOT_FOUND));
    };

    let content = match tokio::fs::read(&file).await {
        Ok(content) => content,
        Err(_) => return Ok(status_response(StatusCode::NOT_FOUND)),
    };

    let length = content.len();
    let body = if req.method() == Method::HEAD {
        Bytes::new()
    } else {
        Bytes::from(content)
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, length)
        .body(Full::new(body))
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR));
    Ok(response)
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Map a URL path to a file under `root`, rejecting anything that escapes it
fn resolve_path(root: &Path, relative: &str) -> Result<PathBuf, PublishError> {
    let trimmed = relative.trim_start_matches('/');
    let invalid = || PublishError::InvalidPath(relative.to_string());

    let mut full_path = root.to_path_buf();
    let mut depth = 0;
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(c) => {
                full_path.push(c);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid())
            }
        }
    }

    if depth == 0 || !full_path.starts_with(root) {
        return Err(invalid());
    }
    Ok(full_path)
}

/// Create missing parents of `file` below `root`; returns those created,
/// outermost first
fn create_parents(root: &Path, file: &Path) -> Result<Vec<PathBuf>, PublishError> {
    let mut missing = Vec::new();
    let mut dir = file.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) || d.exists() {
            break;
        }
        missing.push(d.to_path_buf());
        dir = d.parent();
    }
    missing.reverse();

    for d in &missing {
        std::fs::create_dir(d).map_err(|source| PublishError::Write {
            path: d.clone(),
            source,
        })?;
    }
    Ok(missing)
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), PublishError> {
    std::fs::write(path, content).map_err(|source| PublishError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn bind_error(addr: SocketAddr, source: io::Error) -> PublishError {
    match source.kind() {
        io::ErrorKind::PermissionDenied => PublishError::PrivilegeRequired { addr },
        _ => PublishError::Bind { addr, source },
    }
}
