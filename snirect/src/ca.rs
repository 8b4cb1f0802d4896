//! Dynamic CA and leaf-certificate factory (spec §4.D), grounded on
//! `ferron/src/acme.rs`'s use of `rcgen::{CertificateParams, KeyPair}` plus
//! `x509-parser` to inspect persisted PEM material, and on the key/cert
//! matching check in `core/ca/ca.go`'s `verifyKey`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::RngCore;
use rcgen::{
  BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
  KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use tokio::sync::RwLock;
use x509_parser::prelude::{FromDer, X509Certificate};

const ROOT_COMMON_NAME: &str = "Snirect Root CA";
const ROOT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 3600);
const LEAF_VALIDITY: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, thiserror::Error)]
pub enum CaError {
  #[error("certificate generation failed: {0}")]
  Rcgen(String),
  #[error("key generation failed: {0}")]
  KeyGen(String),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("persisted CA is corrupt or mismatched: {0}")]
  Mismatch(String),
}

/// A signed leaf certificate plus its private key, both DER-encoded, ready
/// to be fed to `rustls`.
#[derive(Clone)]
pub struct LeafCert {
  pub cert_der: rustls_pki_types::CertificateDer<'static>,
  pub key_der: rustls_pki_types::PrivateKeyDer<'static>,
  pub not_after: SystemTime,
}

struct RootCa {
  /// The exact PEM bytes that were loaded or generated — what
  /// `ExportRootPEM` hands back (spec §4.D).
  cert_pem: String,
  key_pem: String,
  /// Used to sign leaf certificates; `signing_cert` is the root's own
  /// realized certificate, required by `signed_by` to derive the leaf's
  /// authority-key-identifier extension.
  signing_key: KeyPair,
  signing_cert: Certificate,
}

/// Generates a fresh RSA-2048 keypair and imports it into an `rcgen::KeyPair`
/// for signing (rcgen itself cannot generate RSA keys, only sign with them —
/// see DESIGN.md).
fn generate_rsa_keypair() -> Result<KeyPair, CaError> {
  let mut rng = rand::rngs::OsRng;
  let private_key = rsa::RsaPrivateKey::new(&mut rng, 2048).map_err(|e| CaError::KeyGen(e.to_string()))?;
  let pkcs8_der = private_key
    .to_pkcs8_der()
    .map_err(|e| CaError::KeyGen(e.to_string()))?;
  KeyPair::from_der(pkcs8_der.as_bytes()).map_err(|e| CaError::Rcgen(e.to_string()))
}

fn root_params() -> CertificateParams {
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, ROOT_COMMON_NAME);
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
  let now = SystemTime::now();
  params.not_before = (now - Duration::from_secs(3600)).into();
  params.not_after = (now + ROOT_VALIDITY).into();
  params
}

fn generate_root() -> Result<RootCa, CaError> {
  let key = generate_rsa_keypair()?;
  let params = root_params();
  let cert = params.self_signed(&key).map_err(|e| CaError::Rcgen(e.to_string()))?;
  Ok(RootCa {
    cert_pem: cert.pem(),
    key_pem: key.serialize_pem(),
    signing_key: key,
    signing_cert: cert,
  })
}

/// Parses a loaded PEM pair and verifies the key matches the certificate's
/// public key, mirroring `core/ca/ca.go`'s `verifyKey`.
fn load_root(cert_pem: &str, key_pem: &str) -> Result<RootCa, CaError> {
  let key = KeyPair::from_pem(key_pem).map_err(|e| CaError::Mismatch(e.to_string()))?;

  let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
    .collect::<Result<_, _>>()
    .map_err(|e| CaError::Mismatch(e.to_string()))?;
  let cert_der = certs.first().ok_or_else(|| CaError::Mismatch("no certificate in PEM".into()))?;
  let (_, parsed) = X509Certificate::from_der(cert_der).map_err(|e| CaError::Mismatch(e.to_string()))?;

  let cert_spki = parsed.tbs_certificate.subject_pki.raw;
  let key_spki = key.public_key_der();
  if cert_spki != key_spki.as_slice() {
    return Err(CaError::Mismatch("key does not match certificate".into()));
  }

  let mut params = root_params();
  // Preserve the original validity window rather than re-deriving one, so
  // a reload doesn't silently extend the root's lifetime.
  params.not_before = parsed.validity().not_before.to_datetime().into();
  params.not_after = parsed.validity().not_after.to_datetime().into();
  let cert = params.self_signed(&key).map_err(|e| CaError::Rcgen(e.to_string()))?;

  Ok(RootCa {
    cert_pem: cert_pem.to_string(),
    key_pem: key_pem.to_string(),
    signing_key: key,
    signing_cert: cert,
  })
}

async fn persist_root(root: &RootCa, cert_path: &Path, key_path: &Path) -> Result<(), CaError> {
  tokio::fs::write(cert_path, &root.cert_pem).await?;
  tokio::fs::write(key_path, &root.key_pem).await?;

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(key_path, perms).await?;
  }

  Ok(())
}

/// Owns the root CA singleton and the leaf-certificate cache (spec §3,
/// invariant 1: at most one root CA is active, and the on-disk pair always
/// matches the in-memory pair).
pub struct CertificateAuthority {
  root: RootCa,
  leaves: RwLock<std::collections::HashMap<String, LeafCert>>,
  sweeper: tokio_util::sync::CancellationToken,
}

impl CertificateAuthority {
  /// Attempts to load an existing root from `cert_path`/`key_path`;
  /// generates and persists a new one if either file is missing, unreadable,
  /// or the key/cert don't match (spec §4.D, `Init`).
  pub async fn init(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>, CaError> {
    let loaded = match (
      tokio::fs::read_to_string(cert_path).await,
      tokio::fs::read_to_string(key_path).await,
    ) {
      (Ok(cert_pem), Ok(key_pem)) => load_root(&cert_pem, &key_pem).ok(),
      _ => None,
    };

    let root = match loaded {
      Some(root) => root,
      None => {
        let root = generate_root()?;
        persist_root(&root, cert_path, key_path).await?;
        root
      }
    };

    let ca = Arc::new(Self {
      root,
      leaves: RwLock::new(std::collections::HashMap::new()),
      sweeper: tokio_util::sync::CancellationToken::new(),
    });

    let weak = Arc::downgrade(&ca);
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(Duration::from_secs(3600));
      loop {
        let Some(ca) = weak.upgrade() else { return };
        tokio::select! {
          _ = interval.tick() => ca.sweep_expired().await,
          _ = ca.sweeper.cancelled() => return,
        }
      }
    });

    Ok(ca)
  }

  pub fn stop(&self) {
    self.sweeper.cancel();
  }

  /// Returns the PEM-encoded root certificate for host-side trust
  /// installation (spec §4.D, `ExportRootPEM`).
  pub fn export_root_pem(&self) -> &str {
    &self.root.cert_pem
  }

  /// Signs (or returns the cached) leaf certificate for `dns_name`,
  /// chained to the root CA (spec §4.D, `SignLeafCert`).
  pub async fn sign_leaf_cert(&self, dns_name: &str) -> Result<LeafCert, CaError> {
    if let Some(cached) = self.leaves.read().await.get(dns_name) {
      if cached.not_after > SystemTime::now() {
        return Ok(cached.clone());
      }
    }

    let leaf_key = KeyPair::generate().map_err(|e| CaError::Rcgen(e.to_string()))?;

    let mut params = CertificateParams::new(vec![dns_name.to_string()]).map_err(|e| CaError::Rcgen(e.to_string()))?;
    let mut serial = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut serial);
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    params.key_usages = vec![KeyUsagePurpose::KeyEncipherment, KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    if let Ok(ip) = dns_name.parse::<std::net::IpAddr>() {
      params.subject_alt_names = vec![SanType::IpAddress(ip)];
    }
    let now = SystemTime::now();
    params.not_before = (now - Duration::from_secs(3600)).into();
    let not_after = now + LEAF_VALIDITY;
    params.not_after = not_after.into();

    let cert = params
      .signed_by(&leaf_key, &self.root.signing_cert, &self.root.signing_key)
      .map_err(|e| CaError::Rcgen(e.to_string()))?;

    let leaf = LeafCert {
      cert_der: rustls_pki_types::CertificateDer::from(cert.der().to_vec()),
      key_der: rustls_pki_types::PrivateKeyDer::try_from(leaf_key.serialize_der())
        .map_err(|e| CaError::Rcgen(e.to_string()))?,
      not_after,
    };

    self.leaves.write().await.insert(dns_name.to_string(), leaf.clone());
    Ok(leaf)
  }

  async fn sweep_expired(&self) {
    let now = SystemTime::now();
    self.leaves.write().await.retain(|_, leaf| leaf.not_after > now);
  }
}

pub fn default_ca_paths(data_dir: &Path) -> (PathBuf, PathBuf) {
  (data_dir.join("ca.crt"), data_dir.join("ca.key"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn init_generates_and_persists_a_root_when_absent() {
    let dir = tempdir();
    let (cert_path, key_path) = default_ca_paths(dir.path());
    let ca = CertificateAuthority::init(&cert_path, &key_path).await.unwrap();
    assert!(ca.export_root_pem().contains("BEGIN CERTIFICATE"));
    assert!(tokio::fs::try_exists(&cert_path).await.unwrap());
    assert!(tokio::fs::try_exists(&key_path).await.unwrap());
    ca.stop();
  }

  #[tokio::test]
  async fn init_reloads_a_matching_persisted_pair() {
    let dir = tempdir();
    let (cert_path, key_path) = default_ca_paths(dir.path());
    let first = CertificateAuthority::init(&cert_path, &key_path).await.unwrap();
    let pem = first.export_root_pem().to_string();
    first.stop();

    let second = CertificateAuthority::init(&cert_path, &key_path).await.unwrap();
    assert_eq!(second.export_root_pem(), pem);
    second.stop();
  }

  #[tokio::test]
  async fn sign_leaf_cert_issues_chain_with_observed_sni() {
    let dir = tempdir();
    let (cert_path, key_path) = default_ca_paths(dir.path());
    let ca = CertificateAuthority::init(&cert_path, &key_path).await.unwrap();

    let leaf = ca.sign_leaf_cert("a.ex.com").await.unwrap();
    let (_, parsed) = X509Certificate::from_der(leaf.cert_der.as_ref()).unwrap();
    let ext = parsed.tbs_certificate.subject_alternative_name().unwrap().unwrap();
    let san_names: Vec<String> = match ext.parsed_extension() {
      x509_parser::extensions::ParsedExtension::SubjectAlternativeName(san) => san
        .general_names
        .iter()
        .filter_map(|name| match name {
          x509_parser::extensions::GeneralName::DNSName(s) => Some(s.to_string()),
          _ => None,
        })
        .collect(),
      _ => Vec::new(),
    };
    assert_eq!(san_names, vec!["a.ex.com".to_string()]);

    ca.stop();
  }

  #[tokio::test]
  async fn sign_leaf_cert_caches_by_dns_name() {
    let dir = tempdir();
    let (cert_path, key_path) = default_ca_paths(dir.path());
    let ca = CertificateAuthority::init(&cert_path, &key_path).await.unwrap();

    let first = ca.sign_leaf_cert("cached.ex.com").await.unwrap();
    let second = ca.sign_leaf_cert("cached.ex.com").await.unwrap();
    assert_eq!(first.cert_der.as_ref(), second.cert_der.as_ref());

    ca.stop();
  }

  fn tempdir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
  }
}
