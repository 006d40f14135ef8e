//! Private key and CSR generation
//!
//! Every attempt generates a fresh key. The CSR carries the identity as both
//! Common Name and a single Subject Alternative Name whose kind follows the
//! identity kind: `DNS:` for domains, `IP:` for addresses.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use certkeeper_config::{Identity, IdentityKind, KeySpec};
use rcgen::string::Ia5String;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, KeyPair, RsaKeySize, SanType,
    PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384, PKCS_RSA_SHA256,
};
use tracing::debug;

use super::error::KeyError;

/// File name of the private key inside the attempt's working directory
pub const KEY_FILE: &str = "private.key";

/// File name of the CSR inside the attempt's working directory
pub const CSR_FILE: &str = "request.csr";

/// A freshly generated private key
#[derive(Clone)]
pub struct KeyMaterial {
    private_key_pem: String,
    spec: KeySpec,
}

impl KeyMaterial {
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub fn spec(&self) -> &KeySpec {
        &self.spec
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("spec", &self.spec)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// A PKCS#10 certificate signing request
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pem: String,
    der: Vec<u8>,
}

impl CertificateRequest {
    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

/// Generate a key and a CSR for `identity`
pub fn generate(
    identity: &Identity,
    spec: &KeySpec,
) -> Result<(KeyMaterial, CertificateRequest), KeyError> {
    let key_pair = key_pair_for(spec)?;

    let mut params = CertificateParams::default();
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, identity.value());
    params.distinguished_name = distinguished_name;
    params.subject_alt_names = vec![san_for(identity)?];

    let csr = params.serialize_request(&key_pair)?;
    let request = CertificateRequest {
        pem: csr.pem()?,
        der: csr.der().to_vec(),
    };

    debug!(
        identity = %identity,
        kind = %identity.kind(),
        key_spec = %spec,
        "Generated private key and CSR"
    );

    Ok((
        KeyMaterial {
            private_key_pem: key_pair.serialize_pem(),
            spec: spec.clone(),
        },
        request,
    ))
}

/// Write key and CSR into the attempt's working directory
///
/// The key file is created owner-only before any bytes are written.
pub fn write_to(
    dir: &Path,
    key: &KeyMaterial,
    csr: &CertificateRequest,
) -> Result<(PathBuf, PathBuf), KeyError> {
    let key_path = dir.join(KEY_FILE);
    let csr_path = dir.join(CSR_FILE);

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&key_path)?;
    file.write_all(key.private_key_pem.as_bytes())?;
    file.sync_all()?;

    fs::write(&csr_path, csr.pem.as_bytes())?;

    debug!(dir = %dir.display(), "Wrote key material to working directory");
    Ok((key_path, csr_path))
}

fn key_pair_for(spec: &KeySpec) -> Result<KeyPair, KeyError> {
    let unsupported = || KeyError::UnsupportedKeySpec(spec.to_string());
    match spec {
        KeySpec::Rsa { bits } => {
            let size = match bits {
                2048 => RsaKeySize::_2048,
                3072 => RsaKeySize::_3072,
                4096 => RsaKeySize::_4096,
                _ => return Err(unsupported()),
            };
            Ok(KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, size)?)
        }
        KeySpec::Ec { curve } => match curve.to_ascii_lowercase().as_str() {
            "prime256v1" | "p-256" | "p256" | "secp256r1" => {
                Ok(KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?)
            }
            "secp384r1" | "p-384" | "p384" => Ok(KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)?),
            _ => Err(unsupported()),
        },
    }
}

fn san_for(identity: &Identity) -> Result<SanType, KeyError> {
    match identity.kind() {
        IdentityKind::Domain => Ok(SanType::DnsName(Ia5String::try_from(
            identity.value().to_string(),
        )?)),
        IdentityKind::Ip => identity
            .ip_addr()
            .map(SanType::IpAddress)
            .ok_or_else(|| KeyError::InvalidIdentity(identity.to_string())),
    }
}
