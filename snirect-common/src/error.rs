//! Error taxonomy (spec §7). Leaf error types use `thiserror`, the way the
//! `httpmock` TLS resolver in the retrieved examples derives its own
//! `Error` enum rather than reaching for a boxed `dyn Error` everywhere.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("config parse error: {0}")]
  Json(#[from] serde_json::Error),
  #[error("invalid config field: {0}")]
  InvalidField(String),
}

/// Top-level engine failures surfaced across the control API (spec §6).
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("engine is already running")]
  AlreadyRunning,
  #[error("engine is not running")]
  NotRunning,
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("certificate authority error: {0}")]
  Ca(String),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}
