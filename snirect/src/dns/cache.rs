//! TTL-clamped resolution cache (spec §4.C), grounded on `core/dns.go`'s
//! `cacheEntry`/`getCache`/`setCache`/`cleanCacheRoutine`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const MIN_TTL: u32 = 300;
const MAX_TTL: u32 = 86400;
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

struct Entry {
  ip: IpAddr,
  expires_at: Instant,
}

/// Clamps a DNS-reported TTL into `[300, 86400]` seconds, treating `0` (the
/// Go backend's "no TTL known" sentinel) as the minimum.
fn clamp_ttl(ttl: u32) -> Duration {
  let ttl = if ttl == 0 { MIN_TTL } else { ttl.clamp(MIN_TTL, MAX_TTL) };
  Duration::from_secs(ttl as u64)
}

pub struct ResolutionCache {
  entries: RwLock<HashMap<String, Entry>>,
}

impl ResolutionCache {
  pub fn new() -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
    }
  }

  pub fn get(&self, host: &str) -> Option<IpAddr> {
    let entries = self.entries.read().unwrap();
    let entry = entries.get(host)?;
    if entry.expires_at > Instant::now() {
      Some(entry.ip)
    } else {
      None
    }
  }

  pub fn set(&self, host: &str, ip: IpAddr, ttl: u32) {
    let expires_at = Instant::now() + clamp_ttl(ttl);
    self.entries.write().unwrap().insert(host.to_string(), Entry { ip, expires_at });
  }

  pub fn sweep_expired(&self) {
    let now = Instant::now();
    self.entries.write().unwrap().retain(|_, entry| entry.expires_at > now);
  }

  pub fn sweep_interval() -> Duration {
    SWEEP_INTERVAL
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn zero_ttl_clamps_to_minimum() {
    assert_eq!(clamp_ttl(0), Duration::from_secs(MIN_TTL as u64));
  }

  #[test]
  fn oversized_ttl_clamps_to_maximum() {
    assert_eq!(clamp_ttl(u32::MAX), Duration::from_secs(MAX_TTL as u64));
  }

  #[test]
  fn hit_then_miss_after_expiry_is_observable_via_set() {
    let cache = ResolutionCache::new();
    let ip: IpAddr = "1.2.3.4".parse().unwrap();
    cache.set("example.com", ip, 300);
    assert_eq!(cache.get("example.com"), Some(ip));
    assert_eq!(cache.get("other.com"), None);
  }
}
