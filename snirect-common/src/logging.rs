//! A minimal channel-based logging pipeline, grounded on
//! `ferron/src/logging.rs` and `ferron-observability-builtin/src/stdlog.rs`.
//!
//! Unlike the teacher, this system has exactly one sink — the host's
//! `OnStatusChanged` callback — so there is no per-vhost `LoggerFilter`
//! machinery here, just a level gate and a channel.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use async_channel::{Receiver, Sender};

/// Severity of a log message (spec §6, `log_level`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
  Debug = 0,
  Info = 1,
  Warn = 2,
  Error = 3,
}

impl FromStr for LogLevel {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "debug" => Ok(LogLevel::Debug),
      "info" => Ok(LogLevel::Info),
      "warn" => Ok(LogLevel::Warn),
      "error" => Ok(LogLevel::Error),
      _ => Err(()),
    }
  }
}

impl fmt::Display for LogLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      LogLevel::Debug => "debug",
      LogLevel::Info => "info",
      LogLevel::Warn => "warn",
      LogLevel::Error => "error",
    })
  }
}

/// A message bound for the host's `OnStatusChanged` callback.
#[derive(Debug, Clone)]
pub struct LogMessage {
  pub level: LogLevel,
  pub text: String,
}

impl LogMessage {
  pub fn new(level: LogLevel, text: impl Into<String>) -> Self {
    Self { level, text: text.into() }
  }
}

/// The level gate plus the channel carrying messages to whatever forwards
/// them to the host. Cloning is cheap — it's just a channel handle and an
/// `Arc`-free atomic.
#[derive(Clone)]
pub struct Logger {
  level: std::sync::Arc<AtomicU8>,
  tx: Sender<LogMessage>,
}

impl Logger {
  /// Creates a logger and its receiving half. The receiving half is driven
  /// by whatever forwards messages to the host callback (see
  /// `snirect::supervisor`).
  pub fn new(level: LogLevel) -> (Self, Receiver<LogMessage>) {
    let (tx, rx) = async_channel::unbounded();
    (
      Self {
        level: std::sync::Arc::new(AtomicU8::new(level as u8)),
        tx,
      },
      rx,
    )
  }

  pub fn set_level(&self, level: LogLevel) {
    self.level.store(level as u8, Ordering::Relaxed);
  }

  fn enabled(&self, level: LogLevel) -> bool {
    level as u8 >= self.level.load(Ordering::Relaxed)
  }

  /// Enqueues a message if its level passes the gate. Never blocks — the
  /// channel is unbounded, matching the teacher's choice to favor logging
  /// throughput over backpressure.
  pub fn log(&self, level: LogLevel, text: impl Into<String>) {
    if !self.enabled(level) {
      return;
    }
    self.tx.send_blocking(LogMessage::new(level, text)).unwrap_or_default();
  }

  pub fn debug(&self, text: impl Into<String>) {
    self.log(LogLevel::Debug, text);
  }

  pub fn info(&self, text: impl Into<String>) {
    self.log(LogLevel::Info, text);
  }

  pub fn warn(&self, text: impl Into<String>) {
    self.log(LogLevel::Warn, text);
  }

  pub fn error(&self, text: impl Into<String>) {
    self.log(LogLevel::Error, text);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn gate_drops_below_configured_level() {
    let (logger, rx) = Logger::new(LogLevel::Warn);
    logger.info("dropped");
    logger.error("kept");
    let msg = rx.recv().await.unwrap();
    assert_eq!(msg.text, "kept");
    assert!(rx.try_recv().is_err());
  }
}
