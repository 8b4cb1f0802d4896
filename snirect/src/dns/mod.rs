//! Protective DNS resolver (spec §4.C), grounded on `core/dns.go`'s
//! `Resolver`: literal-IP short circuit, cache, parallel upstream fan-out
//! racing to first success, system-resolver fallback.

pub mod cache;
pub mod upstream;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use hickory_resolver::TokioResolver;
use snirect_common::logging::Logger;

use crate::protect::ProtectedDialer;
use crate::rules::RuleEngine;
use cache::ResolutionCache;
use upstream::Upstream;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
  #[error("no upstream produced an answer")]
  NoAnswer,
  #[error("system resolver failed: {0}")]
  System(String),
}

pub struct Resolver {
  upstreams: Vec<Upstream>,
  bootstrap: Vec<std::net::SocketAddr>,
  cache: ResolutionCache,
  dialer: Arc<ProtectedDialer>,
  rules: Arc<RuleEngine>,
  system: TokioResolver,
  log: Logger,
}

impl Resolver {
  /// `bootstrap_dns` resolves DoH/DoT upstream hostnames themselves; when
  /// empty, the public default `223.5.5.5:53` is used (spec §4.C).
  pub fn new(
    nameservers: &[String],
    bootstrap_dns: &[String],
    dialer: Arc<ProtectedDialer>,
    rules: Arc<RuleEngine>,
    log: Logger,
  ) -> Arc<Self> {
    let upstreams = nameservers.iter().map(|ns| Upstream::parse(ns)).collect();
    let bootstrap: Vec<std::net::SocketAddr> = bootstrap_dns
      .iter()
      .filter_map(|raw| {
        let addr = if raw.contains(':') { raw.clone() } else { format!("{raw}:53") };
        addr.parse().ok()
      })
      .collect();
    let bootstrap = if bootstrap.is_empty() { upstream::default_bootstrap() } else { bootstrap };
    let system = hickory_resolver::Resolver::builder_tokio()
      .expect("system resolver config")
      .build();

    let resolver = Arc::new(Self {
      upstreams,
      bootstrap,
      cache: ResolutionCache::new(),
      dialer,
      rules,
      system,
      log,
    });

    let weak = Arc::downgrade(&resolver);
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(ResolutionCache::sweep_interval());
      loop {
        interval.tick().await;
        match weak.upgrade() {
          Some(resolver) => resolver.cache.sweep_expired(),
          None => return,
        }
      }
    });

    resolver
  }

  /// Resolves `host` to an address, per spec §4.C's `Resolve`: literal IPs
  /// pass through unchanged, rule-engine aliases take priority over DNS,
  /// then cache, then the upstream race, then the system resolver.
  pub async fn resolve(&self, host: &str) -> Result<IpAddr, ResolveError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
      return Ok(ip);
    }

    if let Some(alias) = self.rules.resolve_host(host) {
      if let Ok(ip) = alias.parse::<IpAddr>() {
        return Ok(ip);
      }
    }

    if let Some(ip) = self.cache.get(host) {
      return Ok(ip);
    }

    if !self.upstreams.is_empty() {
      if let Some(ip) = self.resolve_remote(host).await {
        return Ok(ip);
      }
    }

    self.resolve_system(host).await
  }

  async fn resolve_remote(&self, host: &str) -> Option<IpAddr> {
    let mut attempts = self
      .upstreams
      .iter()
      .map(|upstream| {
        let upstream = upstream.clone();
        let host = host.to_string();
        let dialer = Arc::clone(&self.dialer);
        let bootstrap = self.bootstrap.clone();
        async move { upstream.exchange(&host, RecordType::A, &dialer, UPSTREAM_TIMEOUT, &bootstrap).await.map(|m| (m, upstream)) }
      })
      .collect::<futures::stream::FuturesUnordered<_>>();

    use futures::StreamExt;
    while let Some(result) = attempts.next().await {
      if let Ok((message, upstream)) = result {
        if let Some((ip, ttl)) = upstream::first_a_record(&message) {
          self.cache.set(host, ip, ttl);
          self.log.info(format!("DNS: {host} -> {ip} ({})", upstream.display_address()));
          return Some(ip);
        }
      }
    }
    None
  }

  async fn resolve_system(&self, host: &str) -> Result<IpAddr, ResolveError> {
    let response = self
      .system
      .lookup_ip(host)
      .await
      .map_err(|e| ResolveError::System(e.to_string()))?;
    response.iter().next().ok_or(ResolveError::NoAnswer)
  }

  /// Forwards an intercepted query verbatim by record type and returns the
  /// winning upstream's raw reply message — used by the UDP/53 DNS
  /// intercept's "otherwise forward" path (spec §4.G.3), as opposed to
  /// `resolve`'s address-only, A-record-only, cached view of the world.
  pub async fn resolve_query(&self, host: &str, qtype: RecordType) -> Option<Message> {
    if !self.upstreams.is_empty() {
      if let Some(message) = self.exchange_upstreams(host, qtype).await {
        return Some(message);
      }
    }
    self.resolve_system_typed(host, qtype).await
  }

  async fn exchange_upstreams(&self, host: &str, qtype: RecordType) -> Option<Message> {
    let mut attempts = self
      .upstreams
      .iter()
      .map(|upstream| {
        let upstream = upstream.clone();
        let host = host.to_string();
        let dialer = Arc::clone(&self.dialer);
        let bootstrap = self.bootstrap.clone();
        async move { upstream.exchange(&host, qtype, &dialer, UPSTREAM_TIMEOUT, &bootstrap).await }
      })
      .collect::<futures::stream::FuturesUnordered<_>>();

    use futures::StreamExt;
    while let Some(result) = attempts.next().await {
      if let Ok(message) = result {
        return Some(message);
      }
    }
    None
  }

  async fn resolve_system_typed(&self, host: &str, qtype: RecordType) -> Option<Message> {
    let name = hickory_proto::rr::Name::from_ascii(host).ok()?;
    let lookup = self.system.lookup(name, qtype).await.ok()?;
    let mut message = Message::new();
    message.set_message_type(hickory_proto::op::MessageType::Response);
    message.set_response_code(hickory_proto::op::ResponseCode::NoError);
    for record in lookup.record_iter() {
      message.add_answer(record.clone());
    }
    Some(message)
  }
}
