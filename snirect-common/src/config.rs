//! The JSON configuration schema (see spec §6) and the data model it is
//! parsed into (see spec §3).
//!
//! Mirrors the shape of `ferron-common::config`: plain serde structs for the
//! wire format, plus a richer in-memory representation the engine actually
//! evaluates against. Parsing is intentionally strict — a malformed schema
//! rejects the whole update rather than silently degrading (spec §7,
//! "Config rejection").

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// `cert_verify` polymorphism, modeled as a sum type instead of untyped JSON
/// (see spec §9, "Untyped JSON polymorphism"). Parsed once at config load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertVerifyPolicy {
  /// Full default chain validation.
  Strict,
  /// No verification whatsoever.
  Skip,
  /// Skip the default chain check, but require the peer's chain to validate
  /// against the given DNS name.
  ExpectHost(String),
  /// Skip the default chain check, but require the peer's chain to validate
  /// against any of the given DNS names.
  AllowList(Vec<String>),
}

impl CertVerifyPolicy {
  /// Parses the wire representation: `true`/`"strict"`/`"true"` ⇒ strict,
  /// `false`/`"false"` ⇒ skip, any other string ⇒ `ExpectHost`.
  fn from_wire(value: &CertVerifyWire) -> Self {
    match value {
      CertVerifyWire::Bool(true) => CertVerifyPolicy::Strict,
      CertVerifyWire::Bool(false) => CertVerifyPolicy::Skip,
      CertVerifyWire::Str(s) => match s.as_str() {
        "strict" | "true" => CertVerifyPolicy::Strict,
        "false" => CertVerifyPolicy::Skip,
        hostname => CertVerifyPolicy::ExpectHost(hostname.to_string()),
      },
      CertVerifyWire::List(hosts) => CertVerifyPolicy::AllowList(hosts.clone()),
    }
  }
}

/// Untyped wire shape for `cert_verify`/`verify`: `bool | str | [str]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum CertVerifyWire {
  Bool(bool),
  Str(String),
  List(Vec<String>),
}

/// A single routing rule as published by the config (spec §3, "Rule").
#[derive(Debug, Clone)]
pub struct Rule {
  pub patterns: Vec<String>,
  /// `None` ⇒ leave the original SNI; `Some("")` ⇒ strip the extension;
  /// `Some(s)` ⇒ use `s` upstream.
  pub target_sni: Option<String>,
  /// May itself be a hostname, resolved through the DNS resolver.
  pub target_ip: Option<String>,
  pub cert_verify: Option<CertVerifyPolicy>,
}

/// An entry in the independent certificate-verification table (spec §3,
/// "CertVerifyPolicy").
#[derive(Debug, Clone)]
pub struct CertVerifyRule {
  pub patterns: Vec<String>,
  pub policy: CertVerifyPolicy,
}

/// The fully parsed configuration (spec §3, "Config").
#[derive(Debug, Clone)]
pub struct Config {
  pub rules: Vec<Rule>,
  pub cert_verify: Vec<CertVerifyRule>,
  pub nameservers: Vec<String>,
  pub bootstrap_dns: Vec<String>,
  pub check_hostname: bool,
  pub mtu: u16,
  pub enable_ipv6: bool,
  pub log_level: crate::logging::LogLevel,
}

impl Config {
  /// Parses the §6 JSON schema. Any malformed field rejects the whole
  /// update — callers must keep the previous `Config` active on error.
  pub fn parse(json: &str) -> Result<Self, ConfigError> {
    let wire: ConfigWire = serde_json::from_str(json)?;

    let rules = wire
      .rules
      .into_iter()
      .map(|r| Rule {
        patterns: r.patterns,
        target_sni: r.target_sni,
        target_ip: r.target_ip,
        cert_verify: r.cert_verify.as_ref().map(CertVerifyPolicy::from_wire),
      })
      .collect();

    let cert_verify = wire
      .cert_verify
      .into_iter()
      .map(|v| CertVerifyRule {
        patterns: v.patterns,
        policy: CertVerifyPolicy::from_wire(&v.verify),
      })
      .collect();

    let mtu = match wire.mtu {
      Some(mtu) if mtu > 0 && mtu <= u16::MAX as i64 => mtu as u16,
      Some(mtu) => return Err(ConfigError::InvalidField(format!("mtu out of range: {mtu}"))),
      None => 1500,
    };

    let log_level = match wire.log_level.as_deref() {
      Some(s) => s
        .parse()
        .map_err(|_| ConfigError::InvalidField(format!("unknown log_level: {s}")))?,
      None => crate::logging::LogLevel::Info,
    };

    Ok(Config {
      rules,
      cert_verify,
      nameservers: wire.nameservers.unwrap_or_default(),
      bootstrap_dns: wire.bootstrap_dns.unwrap_or_default(),
      check_hostname: wire.check_hostname.unwrap_or(true),
      mtu,
      enable_ipv6: wire.enable_ipv6.unwrap_or(false),
      log_level,
    })
  }
}

#[derive(Debug, Deserialize)]
struct ConfigWire {
  #[serde(default)]
  rules: Vec<RuleWire>,
  #[serde(default)]
  cert_verify: Vec<CertVerifyRuleWire>,
  nameservers: Option<Vec<String>>,
  bootstrap_dns: Option<Vec<String>>,
  check_hostname: Option<bool>,
  mtu: Option<i64>,
  enable_ipv6: Option<bool>,
  log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RuleWire {
  patterns: Vec<String>,
  target_sni: Option<String>,
  target_ip: Option<String>,
  cert_verify: Option<CertVerifyWire>,
}

#[derive(Debug, Deserialize)]
struct CertVerifyRuleWire {
  patterns: Vec<String>,
  verify: CertVerifyWire,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_minimal_config() {
    let cfg = Config::parse(r#"{"rules":[]}"#).unwrap();
    assert!(cfg.rules.is_empty());
    assert_eq!(cfg.mtu, 1500);
    assert!(!cfg.enable_ipv6);
  }

  #[test]
  fn parses_rule_with_target_sni_strip() {
    let cfg = Config::parse(
      r#"{"rules":[{"patterns":["*.ex.com"],"target_sni":""}]}"#,
    )
    .unwrap();
    assert_eq!(cfg.rules[0].target_sni.as_deref(), Some(""));
  }

  #[test]
  fn cert_verify_polymorphism() {
    let cfg = Config::parse(
      r#"{"rules":[],"cert_verify":[
        {"patterns":["a.com"],"verify":true},
        {"patterns":["b.com"],"verify":"false"},
        {"patterns":["c.com"],"verify":"trusted.example.com"},
        {"patterns":["d.com"],"verify":["a.example.com","b.example.com"]}
      ]}"#,
    )
    .unwrap();
    assert_eq!(cfg.cert_verify[0].policy, CertVerifyPolicy::Strict);
    assert_eq!(cfg.cert_verify[1].policy, CertVerifyPolicy::Skip);
    assert_eq!(
      cfg.cert_verify[2].policy,
      CertVerifyPolicy::ExpectHost("trusted.example.com".to_string())
    );
    assert_eq!(
      cfg.cert_verify[3].policy,
      CertVerifyPolicy::AllowList(vec!["a.example.com".to_string(), "b.example.com".to_string()])
    );
  }

  #[test]
  fn rejects_invalid_mtu() {
    assert!(Config::parse(r#"{"rules":[],"mtu":-1}"#).is_err());
  }

  #[test]
  fn rejects_invalid_log_level() {
    assert!(Config::parse(r#"{"rules":[],"log_level":"verbose"}"#).is_err());
  }
}
