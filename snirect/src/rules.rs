//! The rule engine (spec §4.B): holds the active rule set and the
//! independent certificate-verification table, and answers per-SNI queries.
//!
//! The active set is held behind a reader/writer lock as an `Arc`, so a
//! `LoadRules` swap is a single atomic pointer replace — readers in flight
//! keep seeing the old `Arc` until they re-acquire the lock (spec §3,
//! invariant 2; spec §5, "Rule-set swaps are atomic").

use std::sync::{Arc, RwLock};

use snirect_common::config::{CertVerifyPolicy, Config, Rule};

use crate::pattern;

struct RuleSet {
  rules: Vec<Rule>,
  cert_verify: Vec<(Vec<String>, CertVerifyPolicy)>,
  /// Host/alias table built from rules carrying a literal `target_ip`
  /// (spec §4.B, "ResolveHost").
  aliases: Vec<(Vec<String>, String)>,
}

impl RuleSet {
  fn from_config(config: &Config) -> Self {
    let aliases = config
      .rules
      .iter()
      .filter_map(|r| r.target_ip.clone().map(|ip| (r.patterns.clone(), ip)))
      .collect();

    let cert_verify = config
      .cert_verify
      .iter()
      .map(|cv| (cv.patterns.clone(), cv.policy.clone()))
      .collect();

    RuleSet {
      rules: config.rules.clone(),
      cert_verify,
      aliases,
    }
  }
}

pub struct RuleEngine {
  active: RwLock<Arc<RuleSet>>,
}

impl RuleEngine {
  pub fn new(config: &Config) -> Self {
    Self {
      active: RwLock::new(Arc::new(RuleSet::from_config(config))),
    }
  }

  /// Replaces the active rule set atomically. Called `LoadRules` in spec
  /// §4.B; validation of the incoming config happens before this is called
  /// so that an invalid update never reaches here (spec §7, "Config
  /// rejection" — the previous set remains active on error).
  pub fn load_rules(&self, config: &Config) {
    let next = Arc::new(RuleSet::from_config(config));
    *self.active.write().unwrap() = next;
  }

  /// First-match-wins scan over the rule set in declaration order.
  pub fn match_sni(&self, sni: &str) -> Option<Rule> {
    let set = self.active.read().unwrap().clone();
    set
      .rules
      .iter()
      .find(|rule| rule.patterns.iter().any(|p| pattern::matches(p, sni)))
      .cloned()
  }

  /// Scans the independent cert-verify table (spec §4.B, "MatchCertVerify").
  pub fn match_cert_verify(&self, sni: &str) -> Option<CertVerifyPolicy> {
    let set = self.active.read().unwrap().clone();
    set
      .cert_verify
      .iter()
      .find(|(patterns, _)| patterns.iter().any(|p| pattern::matches(p, sni)))
      .map(|(_, policy)| policy.clone())
  }

  /// Resolves a host alias from rules carrying a literal `target_ip`.
  pub fn resolve_host(&self, sni: &str) -> Option<String> {
    let set = self.active.read().unwrap().clone();
    set
      .aliases
      .iter()
      .find(|(patterns, _)| patterns.iter().any(|p| pattern::matches(p, sni)))
      .map(|(_, ip)| ip.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cfg(json: &str) -> Config {
    Config::parse(json).unwrap()
  }

  #[test]
  fn first_match_wins() {
    let engine = RuleEngine::new(&cfg(
      r#"{"rules":[
        {"patterns":["*.ex.com"],"target_sni":"first"},
        {"patterns":["a.ex.com"],"target_sni":"second"}
      ]}"#,
    ));
    let rule = engine.match_sni("a.ex.com").unwrap();
    assert_eq!(rule.target_sni.as_deref(), Some("first"));
  }

  #[test]
  fn rule_determinism_across_repeated_calls() {
    let engine = RuleEngine::new(&cfg(r#"{"rules":[{"patterns":["example.com"],"target_ip":"1.2.3.4"}]}"#));
    let first = engine.match_sni("example.com");
    let second = engine.match_sni("example.com");
    assert_eq!(first.unwrap().target_ip, second.unwrap().target_ip);
  }

  #[test]
  fn load_rules_swaps_atomically() {
    let engine = RuleEngine::new(&cfg(r#"{"rules":[]}"#));
    assert!(engine.match_sni("example.com").is_none());
    engine.load_rules(&cfg(r#"{"rules":[{"patterns":["example.com"],"target_ip":"9.9.9.9"}]}"#));
    assert_eq!(engine.match_sni("example.com").unwrap().target_ip.as_deref(), Some("9.9.9.9"));
  }

  #[test]
  fn resolve_host_alias() {
    let engine = RuleEngine::new(&cfg(r#"{"rules":[{"patterns":["example.com"],"target_ip":"1.2.3.4"}]}"#));
    assert_eq!(engine.resolve_host("example.com"), Some("1.2.3.4".to_string()));
    assert_eq!(engine.resolve_host("other.com"), None);
  }
}
