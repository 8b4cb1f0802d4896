//! The host ⇄ core callback boundary (spec §6, "Callbacks"; §9, "Callback
//! interface"). A three-method polymorphic handle supplied at start-up,
//! shared by core and host, read-only beyond registration — modeled the way
//! `ferron_common::observability::ObservabilityBackend` exposes a trait
//! object the core holds for the lifetime of the engine.

/// Host-provided callbacks. The engine holds one `Arc<dyn EngineCallbacks>`
/// for its entire lifetime (spec §9, "global singletons... model as a single
/// supervisor value").
pub trait EngineCallbacks: Send + Sync {
  /// A free-form status line; also the log-forwarding target (spec §6).
  fn on_status_changed(&self, status: &str);

  /// Bytes/sec, emitted once per second (spec §4.G.5).
  fn on_speed_updated(&self, up_delta: u64, down_delta: u64);

  /// Must arrange that the given socket bypasses the virtual interface
  /// before any outbound `connect`. Returning `false` is a hard failure for
  /// that socket (spec §4.G.1, "Protected dialer").
  fn protect(&self, fd: std::os::fd::RawFd) -> bool;
}

pub type ProtectFn = std::sync::Arc<dyn EngineCallbacks>;
