//! Installation of issued certificates into the live directory
//!
//! # Directory Structure
//!
//! ```text
//! live/
//! ├── private.key      -> current/private.key
//! ├── certificate.crt  -> current/certificate.crt
//! ├── ca_bundle.crt    -> current/ca_bundle.crt
//! ├── fullchain.crt    -> current/fullchain.crt
//! ├── current          -> .bundles/<id>
//! └── .bundles/
//!     └── <id>/        # the four files plus meta.json
//! ```
//!
//! A new set is written to a fresh bundle directory and made live by
//! renaming a new `current` symlink over the old one, so readers never see
//! the key of one issuance paired with the certificate of another.
//! Without symlink support the files are copied into `live/` one at a time
//! and that guarantee does not hold.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::issuance::InstallError;

pub const KEY_FILE: &str = "private.key";
pub const LEAF_FILE: &str = "certificate.crt";
pub const CHAIN_FILE: &str = "ca_bundle.crt";
pub const FULLCHAIN_FILE: &str = "fullchain.crt";

const META_FILE: &str = "meta.json";
const CURRENT_LINK: &str = "current";
const BUNDLES_DIR: &str = ".bundles";

/// Key plus certificate material ready to install
#[derive(Clone)]
pub struct CertificateBundle {
    private_key_pem: String,
    leaf_pem: String,
    chain_pem: String,
}

impl CertificateBundle {
    pub fn new(
        private_key_pem: impl Into<String>,
        leaf_pem: impl Into<String>,
        chain_pem: impl Into<String>,
    ) -> Self {
        Self {
            private_key_pem: private_key_pem.into(),
            leaf_pem: leaf_pem.into(),
            chain_pem: chain_pem.into(),
        }
    }

    pub fn leaf_pem(&self) -> &str {
        &self.leaf_pem
    }

    pub fn chain_pem(&self) -> &str {
        &self.chain_pem
    }

    /// Leaf followed by the chain; just the leaf when there is no chain
    pub fn full_chain(&self) -> String {
        let mut full = self.leaf_pem.clone();
        if self.chain_pem.trim().is_empty() {
            return full;
        }
        if !full.ends_with('\n') {
            full.push('\n');
        }
        full.push_str(&self.chain_pem);
        full
    }

    fn check(&self) -> Result<(), InstallError> {
        if self.private_key_pem.trim().is_empty() {
            return Err(InstallError::MissingField("private key"));
        }
        if self.leaf_pem.trim().is_empty() {
            return Err(InstallError::MissingField("leaf certificate"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("leaf_bytes", &self.leaf_pem.len())
            .field("chain_bytes", &self.chain_pem.len())
            .finish_non_exhaustive()
    }
}

/// Metadata stored next to each installed bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub identity: String,
    pub order_id: String,
    pub issued: DateTime<Utc>,
    /// Leaf `notAfter`, when the leaf could be parsed
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl CertificateMeta {
    /// Metadata for a bundle issued now
    pub fn new(identity: impl Into<String>, order_id: impl Into<String>, leaf_pem: &str) -> Self {
        Self {
            identity: identity.into(),
            order_id: order_id.into(),
            issued: Utc::now(),
            expires: leaf_expiry(leaf_pem),
        }
    }
}

/// Paths of the four live artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPaths {
    pub private_key: PathBuf,
    pub certificate: PathBuf,
    pub ca_bundle: PathBuf,
    pub fullchain: PathBuf,
}

impl InstalledPaths {
    fn in_dir(dir: &Path) -> Self {
        Self {
            private_key: dir.join(KEY_FILE),
            certificate: dir.join(LEAF_FILE),
            ca_bundle: dir.join(CHAIN_FILE),
            fullchain: dir.join(FULLCHAIN_FILE),
        }
    }

    /// (label, path) pairs in display order
    pub fn entries(&self) -> [(&'static str, &Path); 4] {
        [
            ("private key", &self.private_key),
            ("certificate", &self.certificate),
            ("CA bundle", &self.ca_bundle),
            ("full chain", &self.fullchain),
        ]
    }
}

/// Installs certificate bundles into a live directory
#[derive(Debug, Clone)]
pub struct ArtifactInstaller {
    live_dir: PathBuf,
}

impl ArtifactInstaller {
    pub fn new(live_dir: impl Into<PathBuf>) -> Self {
        Self {
            live_dir: live_dir.into(),
        }
    }

    pub fn live_dir(&self) -> &Path {
        &self.live_dir
    }

    /// Where the live artifacts are (or will be) installed
    pub fn paths(&self) -> InstalledPaths {
        InstalledPaths::in_dir(&self.live_dir)
    }

    /// Stage and commit in one step
    pub fn install(
        &self,
        bundle: &CertificateBundle,
        meta: &CertificateMeta,
    ) -> Result<InstalledPaths, InstallError> {
        self.stage(bundle, meta)?.commit()
    }

    /// Write `bundle` into a fresh bundle directory without making it live
    pub fn stage(
        &self,
        bundle: &CertificateBundle,
        meta: &CertificateMeta,
    ) -> Result<StagedBundle, InstallError> {
        bundle.check()?;

        let bundles = self.live_dir.join(BUNDLES_DIR);
        fs::create_dir_all(&bundles).map_err(InstallError::io(&bundles))?;

        let id = Uuid::new_v4().to_string();
        let dir = bundles.join(&id);
        fs::create_dir(&dir).map_err(InstallError::io(&dir))?;
        // Removes the directory again if any write below fails
        let staged = StagedBundle {
            live_dir: self.live_dir.clone(),
            id,
            committed: false,
        };
        set_mode(&dir, 0o755)?;

        write_private(&dir.join(KEY_FILE), &bundle.private_key_pem)?;
        write_public(&dir.join(LEAF_FILE), &bundle.leaf_pem)?;
        write_public(&dir.join(CHAIN_FILE), &bundle.chain_pem)?;
        write_public(&dir.join(FULLCHAIN_FILE), &bundle.full_chain())?;

        let meta_path = dir.join(META_FILE);
        let meta_json = serde_json::to_string_pretty(meta)
            .map_err(|e| InstallError::io(&meta_path)(std::io::Error::other(e)))?;
        write_public(&meta_path, &meta_json)?;

        debug!(bundle = %staged.id, dir = %dir.display(), "Certificate bundle staged");
        Ok(staged)
    }

    /// Metadata of the live bundle, if any
    pub fn load_meta(&self) -> Result<Option<CertificateMeta>, InstallError> {
        let path = self.meta_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(path = %path.display(), "No installed certificate metadata");
                return Ok(None);
            }
            Err(e) => return Err(InstallError::Io { path, source: e }),
        };

        match serde_json::from_str(&content) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable certificate metadata");
                Ok(None)
            }
        }
    }

    #[cfg(unix)]
    fn meta_path(&self) -> PathBuf {
        self.live_dir.join(CURRENT_LINK).join(META_FILE)
    }

    #[cfg(not(unix))]
    fn meta_path(&self) -> PathBuf {
        self.live_dir.join(META_FILE)
    }

    /// `notAfter` of the installed leaf; `None` when absent or unparseable
    pub fn installed_expiry(&self) -> Result<Option<DateTime<Utc>>, InstallError> {
        let path = self.live_dir.join(LEAF_FILE);
        match fs::read_to_string(&path) {
            Ok(pem) => Ok(leaf_expiry(&pem)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(InstallError::Io { path, source: e }),
        }
    }

    /// Check if the installed certificate needs renewal
    ///
    /// Returns `true` if:
    /// - No certificate is installed
    /// - The installed leaf cannot be parsed
    /// - It expires within `renew_before_days` days
    pub fn needs_renewal(&self, renew_before_days: u32) -> Result<bool, InstallError> {
        let Some(expires) = self.installed_expiry()? else {
            debug!(live_dir = %self.live_dir.display(), "No valid certificate installed, needs issuance");
            return Ok(true);
        };

        let renew_threshold = Utc::now() + chrono::Duration::days(i64::from(renew_before_days));
        let needs_renewal = expires <= renew_threshold;

        if needs_renewal {
            debug!(
                expires = %expires,
                threshold = %renew_threshold,
                "Certificate needs renewal"
            );
        } else {
            trace!(expires = %expires, "Certificate is still valid");
        }

        Ok(needs_renewal)
    }
}

/// A bundle written to disk but not yet live
///
/// Dropping it without `commit` removes the staged directory.
#[derive(Debug)]
pub struct StagedBundle {
    live_dir: PathBuf,
    id: String,
    committed: bool,
}

impl StagedBundle {
    pub fn dir(&self) -> PathBuf {
        self.live_dir.join(BUNDLES_DIR).join(&self.id)
    }

    /// Make this bundle the live one
    ///
    /// Only the bundle `current` pointed at before the swap is pruned, so a
    /// bundle staged concurrently by another install stays intact and its
    /// own commit still lands on a complete set.
    #[cfg(unix)]
    pub fn commit(mut self) -> Result<InstalledPaths, InstallError> {
        let current = self.live_dir.join(CURRENT_LINK);
        let previous = fs::read_link(&current).ok();

        let target = Path::new(BUNDLES_DIR).join(&self.id);
        replace_symlink(&target, &current)?;
        self.committed = true;

        for name in [KEY_FILE, LEAF_FILE, CHAIN_FILE, FULLCHAIN_FILE] {
            let link = self.live_dir.join(name);
            let target = Path::new(CURRENT_LINK).join(name);
            if fs::read_link(&link).ok().as_deref() != Some(target.as_path()) {
                replace_symlink(&target, &link)?;
            }
        }

        if let Some(previous) = previous {
            self.prune(&previous);
        }
        info!(
            live_dir = %self.live_dir.display(),
            bundle = %self.id,
            "Certificate bundle installed"
        );
        Ok(InstalledPaths::in_dir(&self.live_dir))
    }

    /// Make this bundle the live one
    ///
    /// Without symlinks each file is replaced by its own rename, so a reader
    /// racing the commit can observe files from two different issuances.
    /// The staged directory is removed once its files are copied out.
    #[cfg(not(unix))]
    pub fn commit(self) -> Result<InstalledPaths, InstallError> {
        let dir = self.dir();
        for name in [KEY_FILE, LEAF_FILE, CHAIN_FILE, FULLCHAIN_FILE, META_FILE] {
            let tmp = self.live_dir.join(format!(".{}.{}", name, self.id));
            fs::copy(dir.join(name), &tmp).map_err(InstallError::io(&tmp))?;
            let dest = self.live_dir.join(name);
            fs::rename(&tmp, &dest).map_err(InstallError::io(&dest))?;
        }

        info!(live_dir = %self.live_dir.display(), "Certificate bundle installed");
        Ok(InstalledPaths::in_dir(&self.live_dir))
    }

    /// Remove the bundle that was live before this commit
    #[cfg(unix)]
    fn prune(&self, previous: &Path) {
        let path = self.live_dir.join(previous);
        let in_bundles = path
            .parent()
            .is_some_and(|parent| parent == self.live_dir.join(BUNDLES_DIR).as_path());
        if !in_bundles || path.file_name().and_then(|n| n.to_str()) == Some(self.id.as_str()) {
            return;
        }

        match fs::remove_dir_all(&path) {
            Ok(()) => trace!(path = %path.display(), "Pruned previous certificate bundle"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune previous bundle"),
        }
    }
}

impl Drop for StagedBundle {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let dir = self.dir();
        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), error = %e, "Failed to remove staged bundle");
            }
        }
    }
}

/// Parse the first certificate in `pem` and return its `notAfter`
pub fn leaf_expiry(pem: &str) -> Option<DateTime<Utc>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).ok()?;
    let cert = pem.parse_x509().ok()?;
    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
}

/// Point `link` at `target` with a single rename
#[cfg(unix)]
fn replace_symlink(target: &Path, link: &Path) -> Result<(), InstallError> {
    let dir = link.parent().unwrap_or(Path::new("."));
    let tmp = dir.join(format!(".link-{}", Uuid::new_v4()));
    std::os::unix::fs::symlink(target, &tmp).map_err(InstallError::io(&tmp))?;
    if let Err(e) = fs::rename(&tmp, link) {
        let _ = fs::remove_file(&tmp);
        return Err(InstallError::Io {
            path: link.to_path_buf(),
            source: e,
        });
    }
    Ok(())
}

fn write_private(path: &Path, content: &str) -> Result<(), InstallError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(InstallError::io(path))?;
    file.write_all(content.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(InstallError::io(path))
}

fn write_public(path: &Path, content: &str) -> Result<(), InstallError> {
    fs::write(path, content).map_err(InstallError::io(path))?;
    set_mode(path, 0o644)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(InstallError::io(path))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), InstallError> {
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Self-signed PEM certificate expiring on 1 January of `year`
    pub(crate) fn self_signed(name: &str, year: i32) -> String {
        let mut params = rcgen::CertificateParams::new(vec![name.to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(year, 1, 1);
        let key = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    fn bundle(tag: &str) -> CertificateBundle {
        CertificateBundle::new(
            format!("KEY-{}\n", tag),
            format!("LEAF-{}\n", tag),
            format!("CHAIN-{}\n", tag),
        )
    }

    fn meta(tag: &str) -> CertificateMeta {
        CertificateMeta::new("example.com", tag, "")
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    fn bundle_count(live: &Path) -> usize {
        fs::read_dir(live.join(BUNDLES_DIR)).unwrap().count()
    }

    #[test]
    fn test_full_chain() {
        assert_eq!(bundle("a").full_chain(), "LEAF-a\nCHAIN-a\n");
        assert_eq!(
            CertificateBundle::new("K", "LEAF", "CHAIN").full_chain(),
            "LEAF\nCHAIN"
        );
        assert_eq!(CertificateBundle::new("K", "LEAF\n", "").full_chain(), "LEAF\n");
    }

    #[test]
    fn test_install_writes_all_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let installer = ArtifactInstaller::new(temp_dir.path().join("live"));

        let paths = installer.install(&bundle("a"), &meta("order-a")).unwrap();

        assert_eq!(paths, installer.paths());
        assert_eq!(read(&paths.private_key), "KEY-a\n");
        assert_eq!(read(&paths.certificate), "LEAF-a\n");
        assert_eq!(read(&paths.ca_bundle), "CHAIN-a\n");
        assert_eq!(read(&paths.fullchain), "LEAF-a\nCHAIN-a\n");

        let meta = installer.load_meta().unwrap().unwrap();
        assert_eq!(meta.order_id, "order-a");
        assert_eq!(meta.expires, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_install_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let installer = ArtifactInstaller::new(temp_dir.path());
        let paths = installer.install(&bundle("a"), &meta("a")).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&paths.private_key), 0o600);
        assert_eq!(mode(&paths.certificate), 0o644);
        assert_eq!(mode(&paths.ca_bundle), 0o644);
        assert_eq!(mode(&paths.fullchain), 0o644);
    }

    #[test]
    fn test_missing_fields_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let installer = ArtifactInstaller::new(temp_dir.path());

        let err = installer
            .install(&CertificateBundle::new("KEY", " ", "CHAIN"), &meta("a"))
            .unwrap_err();
        assert!(matches!(err, InstallError::MissingField("leaf certificate")));

        let err = installer
            .install(&CertificateBundle::new("", "LEAF", "CHAIN"), &meta("a"))
            .unwrap_err();
        assert!(matches!(err, InstallError::MissingField("private key")));

        assert!(!installer.paths().certificate.exists());
    }

    #[test]
    fn test_missing_chain_degrades_to_leaf() {
        let temp_dir = TempDir::new().unwrap();
        let installer = ArtifactInstaller::new(temp_dir.path());

        let paths = installer
            .install(&CertificateBundle::new("KEY", "LEAF\n", ""), &meta("a"))
            .unwrap();
        assert_eq!(read(&paths.ca_bundle), "");
        assert_eq!(read(&paths.fullchain), "LEAF\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_reinstall_replaces_and_prunes() {
        let temp_dir = TempDir::new().unwrap();
        let installer = ArtifactInstaller::new(temp_dir.path());

        installer.install(&bundle("a"), &meta("a")).unwrap();
        let paths = installer.install(&bundle("b"), &meta("b")).unwrap();

        assert_eq!(read(&paths.private_key), "KEY-b\n");
        assert_eq!(read(&paths.fullchain), "LEAF-b\nCHAIN-b\n");
        assert_eq!(bundle_count(temp_dir.path()), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_uncommitted_stage_leaves_live_set_intact() {
        let temp_dir = TempDir::new().unwrap();
        let installer = ArtifactInstaller::new(temp_dir.path());
        let paths = installer.install(&bundle("a"), &meta("a")).unwrap();

        // Interrupted before commit
        let staged = installer.stage(&bundle("b"), &meta("b")).unwrap();
        let staged_dir = staged.dir();
        assert!(staged_dir.join(KEY_FILE).exists());
        assert_eq!(bundle_count(temp_dir.path()), 2);
        drop(staged);

        assert!(!staged_dir.exists());
        assert_eq!(read(&paths.private_key), "KEY-a\n");
        assert_eq!(read(&paths.certificate), "LEAF-a\n");
        assert_eq!(bundle_count(temp_dir.path()), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_interleaved_commits_last_writer_wins() {
        let temp_dir = TempDir::new().unwrap();
        let installer = ArtifactInstaller::new(temp_dir.path());
        installer.install(&bundle("old"), &meta("old")).unwrap();

        let first = installer.stage(&bundle("a"), &meta("a")).unwrap();
        let second = installer.stage(&bundle("b"), &meta("b")).unwrap();
        let second_dir = second.dir();

        let paths = first.commit().unwrap();
        assert_eq!(read(&paths.private_key), "KEY-a\n");
        assert!(second_dir.join(KEY_FILE).exists());

        let paths = second.commit().unwrap();
        assert_eq!(read(&paths.private_key), "KEY-b\n");
        assert_eq!(read(&paths.certificate), "LEAF-b\n");
        assert_eq!(read(&paths.fullchain), "LEAF-b\nCHAIN-b\n");
        assert_eq!(installer.load_meta().unwrap().unwrap().order_id, "b");
        assert_eq!(bundle_count(temp_dir.path()), 1);
    }

    #[test]
    fn test_leaf_expiry() {
        let pem = self_signed("example.com", 2090);
        let expires = leaf_expiry(&pem).unwrap();
        assert_eq!(expires.format("%Y-%m-%d").to_string(), "2090-01-01");

        assert!(leaf_expiry("LEAF").is_none());
        assert!(leaf_expiry("").is_none());
    }

    #[test]
    fn test_needs_renewal() {
        let temp_dir = TempDir::new().unwrap();
        let installer = ArtifactInstaller::new(temp_dir.path());

        // Nothing installed
        assert!(installer.needs_renewal(30).unwrap());

        // Unparseable leaf
        installer.install(&bundle("a"), &meta("a")).unwrap();
        assert!(installer.needs_renewal(30).unwrap());

        // Expired
        let pem = self_signed("example.com", 2021);
        let expired = CertificateBundle::new("KEY", pem.clone(), "");
        installer
            .install(&expired, &CertificateMeta::new("example.com", "b", &pem))
            .unwrap();
        assert!(installer.needs_renewal(30).unwrap());

        // Far from expiry
        let pem = self_signed("example.com", 2090);
        let fresh = CertificateBundle::new("KEY", pem.clone(), "");
        installer
            .install(&fresh, &CertificateMeta::new("example.com", "c", &pem))
            .unwrap();
        assert!(!installer.needs_renewal(30).unwrap());
        assert!(installer.load_meta().unwrap().unwrap().expires.is_some());
    }
}
