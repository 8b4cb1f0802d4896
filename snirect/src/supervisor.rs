//! Lifecycle and control API (spec §6), grounded on `core/lib.go`'s
//! `StartEngine`/`StopEngine`/`GetCACertificate` plus the `globalEngine`
//! singleton in `core/engine.go`, expanded to the richer component set
//! spec.md describes and to `tokio_util::sync::CancellationToken`-driven
//! shutdown the way `ferron-observability-builtin/src/stdlog.rs` tears down
//! its flush loop.

use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use snirect_common::callbacks::ProtectFn;
use snirect_common::config::Config;
use snirect_common::error::EngineError;
use snirect_common::logging::Logger;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::ca::CertificateAuthority;
use crate::dns::Resolver;
use crate::flow::{
  dns_intercept,
  tcp::{handle_direct_tcp_flow, handle_tls_flow},
  udp::splice_datagram,
  FlowContext,
};
use crate::net::{ByteCounters, IpStack, StackEvent};
use crate::protect::ProtectedDialer;
use crate::rules::RuleEngine;

struct RunningEngine {
  stack_shutdown: CancellationToken,
  speed_ticker: CancellationToken,
  ca: Arc<CertificateAuthority>,
  rules: Arc<RuleEngine>,
  resolver: Arc<Resolver>,
  enable_ipv6: bool,
}

/// Owns every engine singleton and exposes the control API spec §6
/// describes. There is exactly one `Supervisor` per host process; it holds
/// `None` when stopped (spec §3, invariant 3: "at most one engine instance
/// runs at a time").
pub struct Supervisor {
  data_dir: Mutex<PathBuf>,
  running: Mutex<Option<RunningEngine>>,
  log: Logger,
  log_receiver: Mutex<Option<async_channel::Receiver<snirect_common::logging::LogMessage>>>,
}

impl Supervisor {
  pub fn new() -> Arc<Self> {
    let (log, log_receiver) = Logger::new(snirect_common::logging::LogLevel::Info);
    Arc::new(Self {
      data_dir: Mutex::new(PathBuf::from(".")),
      running: Mutex::new(None),
      log,
      log_receiver: Mutex::new(Some(log_receiver)),
    })
  }

  /// Declares where the CA PEM files live (spec §6, `SetDataDir`).
  pub async fn set_data_dir(&self, path: impl Into<PathBuf>) {
    *self.data_dir.lock().await = path.into();
  }

  /// Boots every component and takes ownership of the device fd (spec §6,
  /// `StartEngine`). Idempotent only via `stop_engine` first.
  pub async fn start_engine(
    self: &Arc<Self>,
    device_fd: std::os::fd::RawFd,
    config_json: &str,
    callbacks: ProtectFn,
  ) -> Result<(), EngineError> {
    let mut running = self.running.lock().await;
    if running.is_some() {
      return Err(EngineError::AlreadyRunning);
    }

    let config = Config::parse(config_json)?;
    self.log.set_level(config.log_level);

    let data_dir = self.data_dir.lock().await.clone();
    tokio::fs::create_dir_all(&data_dir).await.ok();
    let (cert_path, key_path) = crate::ca::default_ca_paths(&data_dir);
    let ca = CertificateAuthority::init(&cert_path, &key_path).await.map_err(|e| EngineError::Ca(e.to_string()))?;

    let rules = Arc::new(RuleEngine::new(&config));

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let webpki_roots = Arc::new(roots);

    let client_config = Arc::new(
      rustls::ClientConfig::builder()
        .with_root_certificates((*webpki_roots).clone())
        .with_no_client_auth(),
    );
    let dialer = Arc::new(ProtectedDialer::new(Arc::clone(&callbacks), client_config));

    let resolver = Resolver::new(
      &config.nameservers,
      &config.bootstrap_dns,
      Arc::clone(&dialer),
      Arc::clone(&rules),
      self.log.clone(),
    );

    let counters = Arc::new(ByteCounters::default());
    let (_stack, mut events) = IpStack::spawn(device_fd, config.mtu, config.enable_ipv6, Arc::clone(&counters))
      .map_err(EngineError::Io)?;

    let stack_shutdown = CancellationToken::new();
    let speed_ticker = crate::flow::speed::spawn_speed_ticker(counters, Arc::clone(&callbacks));

    if let Some(receiver) = self.log_receiver.lock().await.take() {
      let callbacks = Arc::clone(&callbacks);
      tokio::spawn(async move {
        while let Ok(message) = receiver.recv().await {
          callbacks.on_status_changed(&message.text);
        }
      });
    }

    let flow_ctx = Arc::new(FlowContext {
      rules: Arc::clone(&rules),
      resolver: Arc::clone(&resolver),
      ca: Some(Arc::clone(&ca)),
      dialer: Arc::clone(&dialer),
      webpki_roots,
      log: self.log.clone(),
    });
    let enable_ipv6 = config.enable_ipv6;
    let loop_shutdown = stack_shutdown.clone();

    tokio::spawn(async move {
      loop {
        tokio::select! {
          event = events.recv() => {
            let Some(event) = event else { return };
            match event {
              // Connections to port 443 go to the MITM-capable handler;
              // other ports go to direct TCP splice (spec §4.F, "TCP
              // forwarder").
              StackEvent::Tcp { conn, dest_addr, dest_port: 443 } => {
                let ctx = Arc::clone(&flow_ctx);
                tokio::spawn(async move {
                  let _ = std::panic::AssertUnwindSafe(handle_tls_flow(conn, dest_addr, &ctx))
                    .catch_unwind()
                    .await;
                });
              }
              StackEvent::Tcp { conn, dest_addr, dest_port } => {
                let ctx = Arc::clone(&flow_ctx);
                tokio::spawn(async move {
                  let _ = std::panic::AssertUnwindSafe(handle_direct_tcp_flow(conn, dest_addr, dest_port, &ctx))
                    .catch_unwind()
                    .await;
                });
              }
              // Destination port 53 is routed to the DNS intercept
              // handler; others to a direct UDP splice (spec §4.F, "UDP
              // forwarder").
              StackEvent::Udp { datagram, reply, dest_port: 53, .. } => {
                let rules = Arc::clone(&flow_ctx.rules);
                let resolver = Arc::clone(&flow_ctx.resolver);
                tokio::spawn(async move {
                  if let Some(answer) = dns_intercept::handle_datagram(&datagram, &rules, &resolver, enable_ipv6).await {
                    let _ = reply.send(answer);
                  }
                });
              }
              StackEvent::Udp { datagram, dest_addr, dest_port, reply, .. } => {
                let dialer = Arc::clone(&flow_ctx.dialer);
                let log = flow_ctx.log.clone();
                tokio::spawn(async move {
                  let dest = std::net::SocketAddr::new(dest_addr, dest_port);
                  if let Some(answer) = splice_datagram(&datagram, dest, &dialer, &log).await {
                    let _ = reply.send(answer);
                  }
                });
              }
            }
          }
          _ = loop_shutdown.cancelled() => return,
        }
      }
    });

    *running = Some(RunningEngine {
      stack_shutdown,
      speed_ticker,
      ca,
      rules,
      resolver,
      enable_ipv6,
    });

    Ok(())
  }

  /// Tears down the stack, halts sweepers/tickers, and clears singletons
  /// (spec §6, `StopEngine`).
  pub async fn stop_engine(&self) -> Result<(), EngineError> {
    let mut running = self.running.lock().await;
    let Some(engine) = running.take() else {
      return Err(EngineError::NotRunning);
    };
    engine.stack_shutdown.cancel();
    engine.speed_ticker.cancel();
    engine.ca.stop();
    Ok(())
  }

  /// Returns the PEM root certificate, initializing the CA under the
  /// configured data dir if the engine isn't running yet (spec §6,
  /// `GetCACertificate`).
  pub async fn get_ca_certificate(&self) -> Result<String, EngineError> {
    if let Some(engine) = self.running.lock().await.as_ref() {
      return Ok(engine.ca.export_root_pem().to_string());
    }
    let data_dir = self.data_dir.lock().await.clone();
    let (cert_path, key_path) = crate::ca::default_ca_paths(&data_dir);
    let ca = CertificateAuthority::init(&cert_path, &key_path).await.map_err(|e| EngineError::Ca(e.to_string()))?;
    let pem = ca.export_root_pem().to_string();
    ca.stop();
    Ok(pem)
  }

  /// Atomically replaces the active rule set (spec §6, `UpdateRules`).
  pub async fn update_rules(&self, config_json: &str) -> Result<(), EngineError> {
    let running = self.running.lock().await;
    let engine = running.as_ref().ok_or(EngineError::NotRunning)?;
    let config = Config::parse(config_json)?;
    engine.rules.load_rules(&config);
    Ok(())
  }

  pub async fn resolver(&self) -> Option<Arc<Resolver>> {
    self.running.lock().await.as_ref().map(|e| Arc::clone(&e.resolver))
  }

  pub async fn rules(&self) -> Option<Arc<RuleEngine>> {
    self.running.lock().await.as_ref().map(|e| Arc::clone(&e.rules))
  }

  pub async fn enable_ipv6(&self) -> bool {
    self.running.lock().await.as_ref().map(|e| e.enable_ipv6).unwrap_or(false)
  }
}
