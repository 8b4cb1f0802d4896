//! `FetchRemote` (spec §6): an HTTPS GET that passes through the same
//! rule/resolver/protected-dialer apparatus as intercepted flows, so a host
//! query for e.g. a remote rule-list update honours the same SNI and IP
//! overrides a live connection would. Grounded on `ferron-common`'s
//! `http_proxy::proxy_client` dial-then-request shape, simplified to a
//! single GET with manual redirect following.

use std::sync::Arc;

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;

use crate::dns::Resolver;
use crate::protect::ProtectedDialer;
use crate::rules::RuleEngine;

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
  #[error("invalid url: {0}")]
  InvalidUrl(String),
  #[error("too many redirects")]
  TooManyRedirects,
  #[error("resolve failed: {0}")]
  Resolve(#[from] crate::dns::ResolveError),
  #[error("connect failed: {0}")]
  Connect(#[from] crate::protect::DialError),
  #[error("tls handshake failed: {0}")]
  Tls(#[from] std::io::Error),
  #[error("http error: {0}")]
  Http(String),
}

/// Performs the GET, honouring rule-engine SNI/IP overrides for the target
/// host and following redirects manually, up to 10 hops (spec §6).
pub async fn fetch_remote(
  url: &str,
  rules: &RuleEngine,
  resolver: &Resolver,
  dialer: &ProtectedDialer,
) -> Result<Vec<u8>, FetchError> {
  let mut current = url.to_string();

  for _ in 0..MAX_REDIRECTS {
    let parsed: http::Uri = current.parse().map_err(|_| FetchError::InvalidUrl(current.clone()))?;
    let host = parsed.host().ok_or_else(|| FetchError::InvalidUrl(current.clone()))?.to_string();
    let port = parsed.port_u16().unwrap_or(443);

    let effective_sni = match rules.match_sni(&host).and_then(|r| r.target_sni) {
      Some(sni) => sni,
      None => host.clone(),
    };
    let dial_ip = match rules.resolve_host(&host) {
      Some(ip) => ip.parse().map_err(|_| FetchError::InvalidUrl(ip))?,
      None => resolver.resolve(&effective_sni).await?,
    };

    let addr = std::net::SocketAddr::new(dial_ip, port);
    let tcp = dialer.connect_tcp(addr).await?;

    let connector = tokio_rustls::TlsConnector::from(Arc::clone(dialer.tls_client_config()));
    let server_name = rustls_pki_types::ServerName::try_from(effective_sni.clone())
      .map_err(|e| FetchError::Tls(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
    let tls = connector.connect(server_name, tcp).await?;

    let io = hyper_util::rt::TokioIo::new(tls);
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
      .await
      .map_err(|e| FetchError::Http(e.to_string()))?;
    tokio::spawn(async move {
      let _ = connection.await;
    });

    let request = hyper::Request::builder()
      .method(hyper::Method::GET)
      .uri(parsed.path_and_query().map(|p| p.as_str()).unwrap_or("/"))
      .header("host", host)
      .body(Empty::<Bytes>::new())
      .map_err(|e| FetchError::Http(e.to_string()))?;

    let response = sender.send_request(request).await.map_err(|e| FetchError::Http(e.to_string()))?;

    if response.status().is_redirection() {
      let location = response
        .headers()
        .get(hyper::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| FetchError::Http("redirect without Location".into()))?
        .to_string();
      current = location;
      continue;
    }

    let body = response.into_body().collect().await.map_err(|e| FetchError::Http(e.to_string()))?.to_bytes();
    return Ok(body.to_vec());
  }

  Err(FetchError::TooManyRedirects)
}
