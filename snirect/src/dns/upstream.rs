//! Upstream DNS backends: plain UDP, DNS-over-TLS and DNS-over-HTTPS, raced
//! in parallel by the resolver (spec §4.C). Grounded on `core/dns.go`'s
//! `parseUpstream`/`dnsUpstream`/`dohUpstream`, re-expressed with
//! `hickory-proto` for wire encoding and `hyper` for the DoH transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::UdpSocket;
use tokio_rustls::TlsConnector;

use crate::protect::ProtectedDialer;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("dns protocol error: {0}")]
  Proto(#[from] hickory_proto::ProtoError),
  #[error("http error: {0}")]
  Http(String),
  #[error("upstream returned rcode {0:?}")]
  Rcode(hickory_proto::op::ResponseCode),
  #[error("no usable address for upstream")]
  NoAddress,
}

/// One configured upstream, parsed from a `nameservers` entry exactly as
/// `parseUpstream` dispatches on scheme in the original implementation.
#[derive(Clone)]
pub enum Upstream {
  Udp { addr: String },
  Tls { addr: String },
  Https { url: String },
}

impl Upstream {
  pub fn parse(raw: &str) -> Self {
    if let Some(url) = raw.strip_prefix("https://") {
      return Upstream::Https { url: format!("https://{url}") };
    }
    if let Some(host) = raw.strip_prefix("tls://") {
      let addr = if host.contains(':') { host.to_string() } else { format!("{host}:853") };
      return Upstream::Tls { addr };
    }
    let addr = if raw.contains(':') { raw.to_string() } else { format!("{raw}:53") };
    Upstream::Udp { addr }
  }

  pub fn display_address(&self) -> &str {
    match self {
      Upstream::Udp { addr } | Upstream::Tls { addr } => addr,
      Upstream::Https { url } => url,
    }
  }

  /// Resolves and queries this upstream for `qtype` records. `bootstrap`
  /// supplies the nameservers used to resolve the DoT endpoint's own
  /// hostname (spec §4.C, "Bootstrap upstreams are used to resolve DoH/DoT
  /// endpoints themselves"). Used both for address resolution (always
  /// `RecordType::A`, spec §9's "only the first A record is cached") and
  /// for passing through an intercepted query's original record type
  /// verbatim (spec §4.G.3, "forward the query through the Resolver
  /// backend").
  pub async fn exchange(
    &self,
    host: &str,
    qtype: RecordType,
    dialer: &ProtectedDialer,
    timeout: Duration,
    bootstrap: &[SocketAddr],
  ) -> Result<Message, UpstreamError> {
    let query = build_query(host, qtype)?;
    let reply = match self {
      Upstream::Udp { addr } => tokio::time::timeout(timeout, exchange_udp(addr, dialer, &query)).await??,
      Upstream::Tls { addr } => tokio::time::timeout(timeout, exchange_tls(addr, dialer, &query, bootstrap)).await??,
      Upstream::Https { url } => tokio::time::timeout(timeout, exchange_doh(url, dialer, &query)).await??,
    };

    if reply.response_code() != hickory_proto::op::ResponseCode::NoError {
      return Err(UpstreamError::Rcode(reply.response_code()));
    }

    Ok(reply)
  }
}

/// The default bootstrap nameserver used when none is configured (spec
/// §4.C): "the public default `223.5.5.5:53` is used".
pub fn default_bootstrap() -> Vec<SocketAddr> {
  vec!["223.5.5.5:53".parse().expect("valid literal address")]
}

/// Resolves `host` (a literal IP or a hostname) against the bootstrap
/// nameservers, trying each in order until one answers.
async fn bootstrap_resolve(host: &str, bootstrap: &[SocketAddr], dialer: &ProtectedDialer) -> Option<std::net::IpAddr> {
  if let Ok(ip) = host.parse() {
    return Some(ip);
  }
  let query = build_query(host, RecordType::A).ok()?;
  for addr in bootstrap {
    let reply = tokio::time::timeout(Duration::from_secs(5), exchange_udp(&addr.to_string(), dialer, &query)).await;
    if let Ok(Ok(message)) = reply {
      if let Some((ip, _ttl)) = first_a_record(&message) {
        return Some(std::net::IpAddr::V4(ip));
      }
    }
  }
  None
}

fn build_query(host: &str, qtype: RecordType) -> Result<Message, UpstreamError> {
  let name = Name::from_ascii(host)?;
  let mut message = Message::new();
  message.set_id(rand::random::<u16>());
  message.set_message_type(MessageType::Query);
  message.set_op_code(OpCode::Query);
  message.set_recursion_desired(true);
  message.add_query(Query::query(name, qtype));
  Ok(message)
}

async fn exchange_udp(addr: &str, dialer: &ProtectedDialer, query: &Message) -> Result<Message, UpstreamError> {
  let target: SocketAddr = addr.parse().map_err(|_| UpstreamError::NoAddress)?;
  let socket = dialer.bind_udp(target).await?;
  let bytes = query.to_bytes()?;
  socket.send_to(&bytes, target).await?;

  let mut buf = [0u8; 4096];
  let n = socket.recv(&mut buf).await?;
  Ok(Message::from_bytes(&buf[..n])?)
}

async fn exchange_tls(
  addr: &str,
  dialer: &ProtectedDialer,
  query: &Message,
  bootstrap: &[SocketAddr],
) -> Result<Message, UpstreamError> {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  let (name, port) = addr.rsplit_once(':').unwrap_or((addr, "853"));
  let port: u16 = port.parse().unwrap_or(853);
  let ip = bootstrap_resolve(name, bootstrap, dialer).await.ok_or(UpstreamError::NoAddress)?;
  let stream = dialer.connect_tcp(SocketAddr::new(ip, port)).await?;
  let server_name = rustls_pki_types::ServerName::try_from(name.to_string())
    .map_err(|_| UpstreamError::NoAddress)?;

  let connector = TlsConnector::from(Arc::clone(dialer.tls_client_config()));
  let mut tls = connector.connect(server_name, stream).await?;

  let payload = query.to_bytes()?;
  let len = (payload.len() as u16).to_be_bytes();
  tls.write_all(&len).await?;
  tls.write_all(&payload).await?;

  let mut len_buf = [0u8; 2];
  tls.read_exact(&mut len_buf).await?;
  let reply_len = u16::from_be_bytes(len_buf) as usize;
  let mut reply_buf = vec![0u8; reply_len];
  tls.read_exact(&mut reply_buf).await?;

  Ok(Message::from_bytes(&reply_buf)?)
}

async fn exchange_doh(url: &str, dialer: &ProtectedDialer, query: &Message) -> Result<Message, UpstreamError> {
  let connector = dialer.hyper_connector();
  let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(connector);

  let payload = query.to_bytes()?;
  let request = hyper::Request::builder()
    .method(hyper::Method::POST)
    .uri(url)
    .header("content-type", "application/dns-message")
    .header("accept", "application/dns-message")
    .body(Full::new(Bytes::from(payload)))
    .map_err(|e| UpstreamError::Http(e.to_string()))?;

  let response = client.request(request).await.map_err(|e| UpstreamError::Http(e.to_string()))?;
  if response.status() != hyper::StatusCode::OK {
    return Err(UpstreamError::Http(format!("doh status {}", response.status())));
  }

  let body = response.into_body().collect().await.map_err(|e| UpstreamError::Http(e.to_string()))?.to_bytes();
  Ok(Message::from_bytes(&body)?)
}

/// Extracts the first A record's address from a successful reply.
pub fn first_a_record(message: &Message) -> Option<(std::net::IpAddr, u32)> {
  message.answers().iter().find_map(|record| match record.data() {
    RData::A(addr) => Some((std::net::IpAddr::V4((*addr).into()), record.ttl())),
    _ => None,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_https_as_doh() {
    matches!(Upstream::parse("https://dns.example/dns-query"), Upstream::Https { .. });
  }

  #[test]
  fn parses_tls_prefix_as_dot() {
    match Upstream::parse("tls://1.1.1.1:853") {
      Upstream::Tls { addr } => assert_eq!(addr, "1.1.1.1:853"),
      _ => panic!("expected Tls"),
    }
  }

  #[test]
  fn bare_host_defaults_to_udp_port_53() {
    match Upstream::parse("1.1.1.1") {
      Upstream::Udp { addr } => assert_eq!(addr, "1.1.1.1:53"),
      _ => panic!("expected Udp"),
    }
  }

  /// `resolve_query`'s typed passthrough (spec §4.G.3) depends on the
  /// query actually carrying the requested record type upstream, not
  /// always `A` — guards against silently re-introducing the A-only
  /// shortcut this module used to take for every intercepted query.
  #[test]
  fn build_query_preserves_requested_record_type() {
    let a = build_query("x.test", RecordType::A).unwrap();
    assert_eq!(a.queries()[0].query_type(), RecordType::A);

    let aaaa = build_query("x.test", RecordType::AAAA).unwrap();
    assert_eq!(aaaa.queries()[0].query_type(), RecordType::AAAA);
  }
}
