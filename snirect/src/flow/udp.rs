//! Non-53 UDP direct datagram splice (spec §4.G.4): no interception, just
//! a single request/response round trip through the protected dialer to
//! the synthesized destination. Grounded on `core/stack.go`'s plain UDP
//! forwarder, minus the DNS-specific handling `dns_intercept` owns.

use std::net::SocketAddr;
use std::time::Duration;

use snirect_common::logging::Logger;
use tokio::time::timeout;

use crate::protect::ProtectedDialer;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends `datagram` to `dest` through a protected socket and returns the
/// first reply, if any arrives before the timeout. Each call owns its own
/// ephemeral socket — there is no persistent NAT table, matching the
/// spec's "direct datagram splice" description with no further detail on
/// session lifetime.
pub async fn splice_datagram(datagram: &[u8], dest: SocketAddr, dialer: &ProtectedDialer, log: &Logger) -> Option<Vec<u8>> {
  let socket = match dialer.bind_udp(dest).await {
    Ok(socket) => socket,
    Err(e) => {
      log.debug(format!("udp splice to {dest} failed to bind: {e}"));
      return None;
    }
  };

  if let Err(e) = socket.send(datagram).await {
    log.debug(format!("udp splice to {dest} failed to send: {e}"));
    return None;
  }

  let mut buf = [0u8; 4096];
  match timeout(REPLY_TIMEOUT, socket.recv(&mut buf)).await {
    Ok(Ok(n)) => Some(buf[..n].to_vec()),
    _ => None,
  }
}
