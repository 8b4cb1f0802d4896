pub mod callbacks;
pub mod config;
pub mod error;
pub mod logging;

pub use callbacks::{EngineCallbacks, ProtectFn};
pub use config::{CertVerifyPolicy, CertVerifyRule, Config, Rule};
pub use error::{ConfigError, EngineError};
pub use logging::{LogLevel, LogMessage};
