//! TCP flow handling — both the MITM-capable port 443 state machine (spec
//! §4.G.1) and the non-443 direct splice (spec §4.G.2). Grounded on
//! `core/proxy.go`'s `handleProxyConnection` for the overall shape (peek,
//! classify, dial, splice), extended with the MITM branch and cert-verify
//! policy dispatch spec.md adds.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use snirect_common::config::CertVerifyPolicy;
use snirect_common::logging::Logger;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::ca::CertificateAuthority;
use crate::dns::Resolver;
use crate::protect::ProtectedDialer;
use crate::rules::RuleEngine;
use crate::sni;

const PEEK_TIMEOUT: Duration = Duration::from_secs(3);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const PEEK_BUF: usize = 4096;

/// Re-feeds an already-consumed prefix ahead of the underlying stream, so a
/// peeked ClientHello can be handed to both a plain splice and a TLS server
/// handshake without actually "unreading" it from the socket (spec §4.G.1,
/// "prefix-replayed wrapper").
pub struct PrefixStream<S> {
  prefix: Vec<u8>,
  offset: usize,
  inner: S,
}

impl<S> PrefixStream<S> {
  pub fn new(prefix: Vec<u8>, inner: S) -> Self {
    Self { prefix, offset: 0, inner }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixStream<S> {
  fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
    if self.offset < self.prefix.len() {
      let remaining = &self.prefix[self.offset..];
      let n = remaining.len().min(buf.remaining());
      buf.put_slice(&remaining[..n]);
      self.offset += n;
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixStream<S> {
  fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }
  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }
  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

/// Everything the TLS flow handler needs, bundled so the forwarder callback
/// can pass it down without threading each singleton through separately.
pub struct FlowContext {
  pub rules: Arc<RuleEngine>,
  pub resolver: Arc<Resolver>,
  pub ca: Option<Arc<CertificateAuthority>>,
  pub dialer: Arc<ProtectedDialer>,
  pub webpki_roots: Arc<rustls::RootCertStore>,
  pub log: Logger,
}

/// Drives one accepted TCP-443 connection through peek, classify, resolve,
/// and the direct-or-MITM branch (spec §4.G.1).
pub async fn handle_tls_flow<S>(mut conn: S, dest_addr: IpAddr, ctx: &FlowContext)
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let mut buf = vec![0u8; PEEK_BUF];
  let n = match timeout(PEEK_TIMEOUT, conn.read(&mut buf)).await {
    Ok(Ok(n)) if n > 0 => n,
    _ => return,
  };
  buf.truncate(n);

  let sni = sni::parse_sni(&buf).ok();
  let classify_name = sni.clone().unwrap_or_else(|| dest_addr.to_string());

  let matched = ctx.rules.match_sni(&classify_name);
  let should_mitm = matched.is_some();

  let upstream_ip = match resolve_upstream(&matched, sni.as_deref(), dest_addr, ctx).await {
    Some(ip) => ip,
    None => return,
  };

  let prefixed = PrefixStream::new(buf, conn);

  if should_mitm {
    let Some(sni_for_leaf) = sni.clone() else { return };
    let target_sni = matched.as_ref().and_then(|r| r.target_sni.clone()).unwrap_or(sni_for_leaf.clone());
    // Rule-local cert-verify policy overrides the independent table (spec
    // §3, "Rule-local policy overrides table policy").
    let policy = matched
      .as_ref()
      .and_then(|r| r.cert_verify.clone())
      .or_else(|| ctx.rules.match_cert_verify(&sni_for_leaf))
      .unwrap_or(CertVerifyPolicy::Strict);
    mitm_flow(prefixed, upstream_ip, &sni_for_leaf, &target_sni, &policy, ctx).await;
  } else {
    direct_flow(prefixed, SocketAddr::new(upstream_ip, 443), ctx).await;
  }
}

async fn resolve_upstream(
  matched: &Option<snirect_common::config::Rule>,
  sni: Option<&str>,
  fallback: IpAddr,
  ctx: &FlowContext,
) -> Option<IpAddr> {
  let Some(rule) = matched else {
    return Some(fallback);
  };

  if let Some(target_ip) = &rule.target_ip {
    return match target_ip.parse::<IpAddr>() {
      Ok(ip) => Some(ip),
      Err(_) => ctx.resolver.resolve(target_ip).await.ok(),
    };
  }
  if let Some(host) = sni {
    return ctx.resolver.resolve(host).await.ok();
  }
  Some(fallback)
}

async fn direct_flow<S>(mut client: S, upstream: SocketAddr, ctx: &FlowContext)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let Ok(Ok(mut remote)) = timeout(DIAL_TIMEOUT, ctx.dialer.connect_tcp(upstream)).await else { return };
  let _ = tokio::io::copy_bidirectional(&mut client, &mut remote).await;
}

/// The non-443 TCP path (spec §4.G.2): no SNI inspection, no rule
/// matching, just a direct bidirectional splice to the synthesized
/// destination through the protected dialer.
pub async fn handle_direct_tcp_flow<S>(mut client: S, dest_addr: IpAddr, dest_port: u16, ctx: &FlowContext)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let upstream = SocketAddr::new(dest_addr, dest_port);
  let Ok(Ok(mut remote)) = timeout(DIAL_TIMEOUT, ctx.dialer.connect_tcp(upstream)).await else { return };
  let _ = tokio::io::copy_bidirectional(&mut client, &mut remote).await;
}

async fn mitm_flow<S>(
  client: S,
  upstream_ip: IpAddr,
  observed_sni: &str,
  target_sni: &str,
  policy: &CertVerifyPolicy,
  ctx: &FlowContext,
) where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let Some(ca) = &ctx.ca else {
    ctx.log.warn("MITM required but CA unavailable; closing connection".to_string());
    return;
  };

  let leaf = match ca.sign_leaf_cert(observed_sni).await {
    Ok(leaf) => leaf,
    Err(e) => {
      ctx.log.warn(format!("leaf cert signing failed for {observed_sni}: {e}"));
      return;
    }
  };

  let server_config = match rustls::ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(vec![leaf.cert_der], leaf.key_der)
  {
    Ok(config) => Arc::new(config),
    Err(_) => return,
  };

  let acceptor = TlsAcceptor::from(server_config);
  let client_tls = match acceptor.accept(client).await {
    Ok(stream) => stream,
    Err(_) => return,
  };

  let client_config = crate::tls_verify::client_config_for_policy(policy, Arc::clone(&ctx.webpki_roots));
  let connector = TlsConnector::from(Arc::new(client_config));

  let upstream_addr = SocketAddr::new(upstream_ip, 443);
  let Ok(Ok(remote_tcp)) = timeout(DIAL_TIMEOUT, ctx.dialer.connect_tcp(upstream_addr)).await else { return };

  // An empty `target_sni` produces an absent SNI extension upstream, not an
  // empty one (spec §4.G.1).
  let server_name = if target_sni.is_empty() {
    rustls_pki_types::ServerName::IpAddress(upstream_ip.into())
  } else {
    match rustls_pki_types::ServerName::try_from(target_sni.to_string()) {
      Ok(name) => name,
      Err(_) => return,
    }
  };

  let remote_tls = match connector.connect(server_name, remote_tcp).await {
    Ok(stream) => stream,
    Err(_) => return,
  };

  let mut client_tls = client_tls;
  let mut remote_tls = remote_tls;
  let _ = tokio::io::copy_bidirectional(&mut client_tls, &mut remote_tls).await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use snirect_common::config::Config;
  use tokio_test::io::Builder as MockIoBuilder;

  fn rule_engine(json: &str) -> Arc<RuleEngine> {
    Arc::new(RuleEngine::new(&Config::parse(json).unwrap()))
  }

  fn flow_context(rules: Arc<RuleEngine>) -> FlowContext {
    struct NoopCallbacks;
    impl snirect_common::callbacks::EngineCallbacks for NoopCallbacks {
      fn on_status_changed(&self, _status: &str) {}
      fn on_speed_updated(&self, _up: u64, _down: u64) {}
      fn protect(&self, _fd: std::os::fd::RawFd) -> bool {
        true
      }
    }
    let client_config = Arc::new(
      rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth(),
    );
    let dialer = Arc::new(ProtectedDialer::new(Arc::new(NoopCallbacks), client_config));
    let (log, _rx) = snirect_common::logging::Logger::new(snirect_common::logging::LogLevel::Error);
    let resolver = Resolver::new(&[], &[], Arc::clone(&dialer), Arc::clone(&rules), log.clone());
    FlowContext {
      rules,
      resolver,
      ca: None,
      dialer,
      webpki_roots: Arc::new(rustls::RootCertStore::empty()),
      log,
    }
  }

  /// Seed scenario 1 (spec §8): an exact-match rule carrying a literal
  /// `target_ip` redirects without touching the resolver or the SNI at
  /// all — direct forward, no MITM, since no `target_sni` is set.
  #[tokio::test]
  async fn exact_rule_redirect_uses_literal_target_ip() {
    let rules = rule_engine(r#"{"rules":[{"patterns":["example.com"],"target_ip":"1.2.3.4"}]}"#);
    let ctx = flow_context(Arc::clone(&rules));
    let matched = rules.match_sni("example.com");
    assert!(matched.is_some());

    let fallback: IpAddr = "9.9.9.9".parse().unwrap();
    let resolved = resolve_upstream(&matched, Some("example.com"), fallback, &ctx).await;
    assert_eq!(resolved, Some("1.2.3.4".parse().unwrap()));
  }

  /// No rule match at all falls back to the original destination IP from
  /// the 5-tuple (spec §4.G.1, "keep the original target IP").
  #[tokio::test]
  async fn no_match_keeps_original_destination() {
    let rules = rule_engine(r#"{"rules":[]}"#);
    let ctx = flow_context(Arc::clone(&rules));
    let fallback: IpAddr = "9.9.9.9".parse().unwrap();
    let resolved = resolve_upstream(&None, Some("unrelated.invalid"), fallback, &ctx).await;
    assert_eq!(resolved, Some(fallback));
  }

  #[tokio::test]
  async fn prefix_stream_replays_peeked_bytes_before_inner() {
    let inner = MockIoBuilder::new().read(b"tail").build();
    let mut stream = PrefixStream::new(b"head-".to_vec(), inner);

    let mut buf = [0u8; 64];
    let n1 = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n1], b"head-");
    let n2 = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n2], b"tail");
  }
}
