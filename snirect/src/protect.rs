//! Protected outbound dialer (spec §3, §5, §6): every raw socket opened on
//! behalf of a flow is handed to the host's `Protect(fd)` callback before
//! `connect`, so it bypasses the virtual interface instead of looping back
//! through it. Grounded on the `Protect(fd) -> bool` contract in spec §6 and
//! on `ferron-common`'s practice of keeping a small owned context handle
//! (rather than a cyclic back-reference) alongside a dial helper.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use snirect_common::callbacks::ProtectFn;
use tokio::net::{TcpStream, UdpSocket};

#[derive(Debug, thiserror::Error)]
pub enum DialError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("host refused to protect socket")]
  ProtectRefused,
}

/// Wraps the host `Protect` callback plus the TLS client config shared by
/// every outbound connection this engine makes (DoT upstreams, DoH, MITM
/// server-side-verification connects, `FetchRemote`).
pub struct ProtectedDialer {
  protect: ProtectFn,
  tls_client_config: Arc<rustls::ClientConfig>,
}

impl ProtectedDialer {
  pub fn new(protect: ProtectFn, tls_client_config: Arc<rustls::ClientConfig>) -> Self {
    Self { protect, tls_client_config }
  }

  pub fn tls_client_config(&self) -> &Arc<rustls::ClientConfig> {
    &self.tls_client_config
  }

  fn protect_or_refuse(&self, fd: std::os::fd::RawFd) -> Result<(), DialError> {
    if self.protect.protect(fd) {
      Ok(())
    } else {
      Err(DialError::ProtectRefused)
    }
  }

  /// Opens a protected TCP connection to `addr`.
  pub async fn connect_tcp(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
    let socket = match addr {
      SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
      SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
    };
    self.protect_or_refuse(socket.as_raw_fd())?;
    Ok(socket.connect(addr).await?)
  }

  /// Opens a protected TCP connection to `host:port`, returning the
  /// server-name wrapper TLS needs alongside the raw stream.
  pub async fn connect_tls(
    &self,
    host: &str,
    port: u16,
  ) -> Result<(rustls_pki_types::ServerName<'static>, TcpStream), DialError> {
    let addr = tokio::net::lookup_host((host, port))
      .await?
      .next()
      .ok_or_else(|| DialError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no address")))?;
    let stream = self.connect_tcp(addr).await?;
    let name = rustls_pki_types::ServerName::try_from(host.to_string())
      .map_err(|e| DialError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
    Ok((name, stream))
  }

  /// Opens a protected, connected UDP socket for a single upstream exchange.
  pub async fn bind_udp(&self, peer: SocketAddr) -> Result<UdpSocket, DialError> {
    let bind_addr: SocketAddr = if peer.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };
    let socket = UdpSocket::bind(bind_addr).await?;
    self.protect_or_refuse(socket.as_raw_fd())?;
    socket.connect(peer).await?;
    Ok(socket)
  }

  /// A `hyper` connector that dials through this protected path, for DoH and
  /// `FetchRemote`.
  pub fn hyper_connector(&self) -> ProtectedHttpsConnector {
    ProtectedHttpsConnector {
      tls_client_config: Arc::clone(&self.tls_client_config),
      protect: Arc::clone(&self.protect),
    }
  }
}

/// A minimal `tower`-style connector satisfying `hyper_util::client::legacy`'s
/// `Connect` bound, dialing every connection through the protected path
/// before handing it to `hyper`.
#[derive(Clone)]
pub struct ProtectedHttpsConnector {
  tls_client_config: Arc<rustls::ClientConfig>,
  protect: ProtectFn,
}

impl ProtectedHttpsConnector {
  async fn connect(&self, dst: http::Uri) -> Result<tokio_rustls::TlsStream<TcpStream>, DialError> {
    let host = dst.host().ok_or_else(|| DialError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing host")))?;
    let port = dst.port_u16().unwrap_or(if dst.scheme_str() == Some("https") { 443 } else { 80 });

    let addr = tokio::net::lookup_host((host, port))
      .await?
      .next()
      .ok_or_else(|| DialError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no address")))?;

    let socket = match addr {
      SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
      SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
    };
    if !self.protect.protect(socket.as_raw_fd()) {
      return Err(DialError::ProtectRefused);
    }
    let stream = socket.connect(addr).await?;

    let connector = tokio_rustls::TlsConnector::from(Arc::clone(&self.tls_client_config));
    let name = rustls_pki_types::ServerName::try_from(host.to_string())
      .map_err(|e| DialError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
    let tls = connector.connect(name, stream).await?;
    Ok(tokio_rustls::TlsStream::Client(tls))
  }
}

impl tower_service::Service<http::Uri> for ProtectedHttpsConnector {
  type Response = hyper_util::rt::TokioIo<tokio_rustls::TlsStream<TcpStream>>;
  type Error = DialError;
  type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

  fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
    std::task::Poll::Ready(Ok(()))
  }

  fn call(&mut self, dst: http::Uri) -> Self::Future {
    let this = self.clone();
    Box::pin(async move { this.connect(dst).await.map(hyper_util::rt::TokioIo::new) })
  }
}
