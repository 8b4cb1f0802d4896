//! Once-per-second throughput reporting (spec §4.G.5), grounded on the
//! atomic-counter + ticker shape used throughout `ferron`'s connection
//! accounting.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use snirect_common::callbacks::ProtectFn;

use crate::net::ByteCounters;

/// Spawns the ticker that samples `counters` once a second and reports the
/// delta since the previous tick to the host callback. Returns a token that
/// stops the ticker when dropped/cancelled (spec §5, "halts the speed-
/// ticker" on stop).
pub fn spawn_speed_ticker(counters: Arc<ByteCounters>, callbacks: ProtectFn) -> tokio_util::sync::CancellationToken {
  let token = tokio_util::sync::CancellationToken::new();
  let child = token.clone();

  tokio::spawn(async move {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut last_up = 0u64;
    let mut last_down = 0u64;
    loop {
      tokio::select! {
        _ = interval.tick() => {
          let up = counters.uploaded.load(Ordering::Relaxed);
          let down = counters.downloaded.load(Ordering::Relaxed);
          callbacks.on_speed_updated(up.saturating_sub(last_up), down.saturating_sub(last_down));
          last_up = up;
          last_down = down;
        }
        _ = child.cancelled() => return,
      }
    }
  });

  token
}
