//! Custom `rustls` server-cert verifiers implementing the `CertVerifyPolicy`
//! sum type (spec §4.B, §4.G.1), grounded on `ferron/src/tls_util.rs`'s
//! pattern of building small `ServerCertVerifier` impls around the
//! `rustls::client::danger` traits rather than hand-rolling chain walking.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use snirect_common::config::CertVerifyPolicy;

/// Accepts any certificate chain without validation (`CertVerifyPolicy::Skip`).
#[derive(Debug)]
struct AcceptAnyVerifier {
  provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.provider.signature_verification_algorithms.supported_schemes()
  }
}

/// Validates the chain against the default webpki roots, but against an
/// overridden expected name instead of the connection's actual SNI
/// (`CertVerifyPolicy::ExpectHost`/`AllowList`).
#[derive(Debug)]
struct ExpectedNameVerifier {
  inner: Arc<rustls::client::WebPkiServerVerifier>,
  allowed_names: Vec<String>,
}

impl ServerCertVerifier for ExpectedNameVerifier {
  fn verify_server_cert(
    &self,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    ocsp_response: &[u8],
    now: UnixTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    let mut last_err = None;
    for name in &self.allowed_names {
      let Ok(server_name) = ServerName::try_from(name.clone()) else { continue };
      match self
        .inner
        .verify_server_cert(end_entity, intermediates, &server_name, ocsp_response, now)
      {
        Ok(ok) => return Ok(ok),
        Err(e) => last_err = Some(e),
      }
    }
    Err(last_err.unwrap_or(rustls::Error::General("no allowed name validated".into())))
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    self.inner.verify_tls12_signature(message, cert, dss)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    self.inner.verify_tls13_signature(message, cert, dss)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.inner.supported_verify_schemes()
  }
}

/// Builds a one-shot `rustls::ClientConfig` enforcing `policy` for a single
/// upstream TLS handshake (spec §4.G.1, "verification per §4.B policy").
pub fn client_config_for_policy(policy: &CertVerifyPolicy, webpki_roots: Arc<rustls::RootCertStore>) -> rustls::ClientConfig {
  let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

  let builder = rustls::ClientConfig::builder();
  match policy {
    CertVerifyPolicy::Strict => builder.with_root_certificates((*webpki_roots).clone()).with_no_client_auth(),
    CertVerifyPolicy::Skip => {
      let mut config = builder.with_root_certificates((*webpki_roots).clone()).with_no_client_auth();
      config
        .dangerous()
        .set_certificate_verifier(Arc::new(AcceptAnyVerifier { provider }));
      config
    }
    CertVerifyPolicy::ExpectHost(host) => {
      let inner = rustls::client::WebPkiServerVerifier::builder(webpki_roots).build().expect("default verifier builds");
      let mut config = builder
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
      config.dangerous().set_certificate_verifier(Arc::new(ExpectedNameVerifier {
        inner,
        allowed_names: vec![host.clone()],
      }));
      config
    }
    CertVerifyPolicy::AllowList(hosts) => {
      let inner = rustls::client::WebPkiServerVerifier::builder(webpki_roots).build().expect("default verifier builds");
      let mut config = builder
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
      config.dangerous().set_certificate_verifier(Arc::new(ExpectedNameVerifier {
        inner,
        allowed_names: hosts.clone(),
      }));
      config
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn empty_roots() -> Arc<rustls::RootCertStore> {
    Arc::new(rustls::RootCertStore::empty())
  }

  #[test]
  fn every_policy_variant_builds_a_client_config() {
    let _ = client_config_for_policy(&CertVerifyPolicy::Strict, empty_roots());
    let _ = client_config_for_policy(&CertVerifyPolicy::Skip, empty_roots());
    let _ = client_config_for_policy(&CertVerifyPolicy::ExpectHost("trusted.example.com".into()), empty_roots());
    let _ = client_config_for_policy(&CertVerifyPolicy::AllowList(vec!["a.example.com".into(), "b.example.com".into()]), empty_roots());
  }

  #[test]
  fn skip_verifier_accepts_supported_schemes_from_the_provider() {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = AcceptAnyVerifier { provider: Arc::clone(&provider) };
    assert_eq!(
      verifier.supported_verify_schemes(),
      provider.signature_verification_algorithms.supported_schemes()
    );
  }
}
