//! UDP port 53 interception (spec §4.G.3), grounded on `core/dns.go`'s
//! `handleDNSConnection`, extended with the alias/AAAA-suppression rules
//! spec.md adds on top of that bare forward-to-backend behaviour.

use std::net::Ipv4Addr;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

use crate::dns::Resolver;
use crate::rules::RuleEngine;

const ALIAS_TTL: u32 = 3600;

/// Answers one intercepted DNS datagram, returning the reply bytes to send
/// back, or `None` if the datagram was unparseable (dropped silently, as
/// the original implementation does on `Unpack` failure).
pub async fn handle_datagram(datagram: &[u8], rules: &RuleEngine, resolver: &Resolver, enable_ipv6: bool) -> Option<Vec<u8>> {
  let query = Message::from_bytes(datagram).ok()?;
  let question = query.queries().first()?.clone();
  let host = question.name().to_ascii();
  let host = host.trim_end_matches('.');
  let qtype = question.query_type();

  let alias = rules.resolve_host(host).and_then(|ip| ip.parse::<Ipv4Addr>().ok());

  if !enable_ipv6 && qtype == RecordType::AAAA {
    return Some(empty_success(&query));
  }

  if qtype == RecordType::A {
    if let Some(ip) = alias {
      return Some(synthetic_a_reply(&query, &question, ip));
    }
  }

  if qtype == RecordType::AAAA && alias.is_some() {
    return Some(empty_success(&query));
  }

  let reply = forward_to_resolver(&query, &question, resolver).await;
  Some(reply.unwrap_or_else(|| empty_success(&query)))
}

fn base_reply(query: &Message) -> Message {
  let mut reply = Message::new();
  reply.set_id(query.id());
  reply.set_message_type(MessageType::Response);
  reply.set_op_code(query.op_code());
  reply.set_recursion_desired(query.recursion_desired());
  reply.set_recursion_available(true);
  reply.add_queries(query.queries().to_vec());
  reply
}

fn empty_success(query: &Message) -> Vec<u8> {
  let mut reply = base_reply(query);
  reply.set_response_code(ResponseCode::NoError);
  reply.to_bytes().unwrap_or_default()
}

fn synthetic_a_reply(query: &Message, question: &hickory_proto::op::Query, ip: Ipv4Addr) -> Vec<u8> {
  let mut reply = base_reply(query);
  reply.set_response_code(ResponseCode::NoError);
  let mut record = Record::new();
  record.set_name(question.name().clone());
  record.set_record_type(RecordType::A);
  record.set_ttl(ALIAS_TTL);
  record.set_data(RData::A(A(ip)));
  reply.add_answer(record);
  reply.to_bytes().unwrap_or_default()
}

/// Forwards the intercepted query upstream with its original record type
/// preserved (spec §4.G.3, "Otherwise forward the query through the
/// Resolver backend and return its reply") — an AAAA question must not come
/// back carrying a synthesized A answer.
async fn forward_to_resolver(query: &Message, question: &hickory_proto::op::Query, resolver: &Resolver) -> Option<Vec<u8>> {
  let host = question.name().to_ascii();
  let host = host.trim_end_matches('.');
  let upstream_reply = resolver.resolve_query(host, question.query_type()).await?;

  let mut reply = base_reply(query);
  reply.set_response_code(upstream_reply.response_code());
  reply.add_answers(upstream_reply.answers().to_vec());
  reply.to_bytes().ok()
}

#[cfg(test)]
mod tests {
  use super::*;
  use hickory_proto::op::Query;
  use hickory_proto::rr::Name;
  use std::sync::Arc;

  fn query_bytes(name: &str, qtype: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(42);
    message.set_message_type(MessageType::Query);
    message.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
    message.to_bytes().unwrap()
  }

  fn test_resolver() -> crate::dns::Resolver {
    struct NoopCallbacks;
    impl snirect_common::callbacks::EngineCallbacks for NoopCallbacks {
      fn on_status_changed(&self, _status: &str) {}
      fn on_speed_updated(&self, _up: u64, _down: u64) {}
      fn protect(&self, _fd: std::os::fd::RawFd) -> bool {
        true
      }
    }
    let client_config = Arc::new(
      rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth(),
    );
    let dialer = Arc::new(crate::protect::ProtectedDialer::new(Arc::new(NoopCallbacks), client_config));
    let config = snirect_common::config::Config::parse(r#"{"rules":[]}"#).unwrap();
    let rules = Arc::new(RuleEngine::new(&config));
    let (log, _rx) = snirect_common::logging::Logger::new(snirect_common::logging::LogLevel::Error);
    let resolver = crate::dns::Resolver::new(&[], &[], dialer, rules, log);
    Arc::try_unwrap(resolver).unwrap_or_else(|_| unreachable!())
  }

  #[tokio::test]
  async fn aaaa_query_returns_empty_success_when_ipv6_disabled() {
    let rules = RuleEngine::new(&snirect_common::config::Config::parse(r#"{"rules":[]}"#).unwrap());
    let resolver = test_resolver();
    let datagram = query_bytes("x.test.", RecordType::AAAA);

    let reply = handle_datagram(&datagram, &rules, &resolver, false).await.unwrap();
    let message = Message::from_bytes(&reply).unwrap();
    assert_eq!(message.response_code(), ResponseCode::NoError);
    assert!(message.answers().is_empty());
  }

  #[tokio::test]
  async fn a_query_returns_synthetic_alias_when_rule_matches() {
    let rules = RuleEngine::new(
      &snirect_common::config::Config::parse(r#"{"rules":[{"patterns":["x.test"],"target_ip":"9.9.9.9"}]}"#).unwrap(),
    );
    let resolver = test_resolver();
    let datagram = query_bytes("x.test.", RecordType::A);

    let reply = handle_datagram(&datagram, &rules, &resolver, true).await.unwrap();
    let message = Message::from_bytes(&reply).unwrap();
    let answer = message.answers().first().unwrap();
    match answer.data() {
      RData::A(addr) => assert_eq!(addr.0, std::net::Ipv4Addr::new(9, 9, 9, 9)),
      _ => panic!("expected an A record"),
    }
  }

  #[tokio::test]
  async fn aaaa_query_suppressed_when_an_a_alias_exists() {
    let rules = RuleEngine::new(
      &snirect_common::config::Config::parse(r#"{"rules":[{"patterns":["x.test"],"target_ip":"9.9.9.9"}]}"#).unwrap(),
    );
    let resolver = test_resolver();
    let datagram = query_bytes("x.test.", RecordType::AAAA);

    let reply = handle_datagram(&datagram, &rules, &resolver, true).await.unwrap();
    let message = Message::from_bytes(&reply).unwrap();
    assert_eq!(message.response_code(), ResponseCode::NoError);
    assert!(message.answers().is_empty());
  }
}
