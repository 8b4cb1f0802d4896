//! TLS ClientHello SNI dissection and in-place rewriting (spec §4.E).
//!
//! The fixed offset walk and the rewrite constraint (equal-length
//! substitution only) are carried over verbatim from `core/proxy.go`'s
//! `findSNIPos`/`parseSNI`/`tryModifySNI` in the original implementation —
//! see spec §9, "the rewrite helper only succeeds for equal-length SNI
//! substitutions".

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
  #[error("record too short")]
  TooShort,
  #[error("length field overflows buffer")]
  Overflow,
  #[error("no server_name extension present")]
  NotFound,
}

/// Locates the byte offset of the server_name extension's `name_type` field
/// within `buf`, per the fixed walk in spec §4.E.
fn find_sni_pos(buf: &[u8]) -> Result<usize, SniError> {
  if buf.len() < 43 {
    return Err(SniError::TooShort);
  }

  // 5 (record header) + 4 (handshake header) + 2 (client_version) + 32 (random)
  let mut pos = 9 + 2 + 32;

  let session_id_len = buf[pos] as usize;
  pos += 1 + session_id_len;
  if pos + 2 > buf.len() {
    return Err(SniError::Overflow);
  }

  let cipher_suites_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
  pos += 2 + cipher_suites_len;
  if pos + 1 > buf.len() {
    return Err(SniError::Overflow);
  }

  let compression_methods_len = buf[pos] as usize;
  pos += 1 + compression_methods_len;
  if pos + 2 > buf.len() {
    return Err(SniError::Overflow);
  }

  let extensions_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
  pos += 2;
  let extensions_end = pos + extensions_len;

  while pos + 4 <= extensions_end && pos + 4 <= buf.len() {
    let ext_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    let ext_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
    pos += 4;
    if ext_type == 0x0000 {
      // Skip the 2-byte server_name_list length; land on name_type.
      if pos + 2 > buf.len() {
        return Err(SniError::Overflow);
      }
      return Ok(pos + 2);
    }
    pos += ext_len;
  }

  Err(SniError::NotFound)
}

/// Parses the SNI hostname out of a ClientHello record. Never mutates
/// `buf`. Falls through on short/malformed input or a missing extension —
/// callers use that to fall back to direct forwarding (spec §7).
pub fn parse_sni(buf: &[u8]) -> Result<String, SniError> {
  let pos = find_sni_pos(buf)?;
  // `pos` is the name_type byte; the 2-byte host_name length follows it.
  if pos + 3 > buf.len() {
    return Err(SniError::Overflow);
  }
  let name_len = u16::from_be_bytes([buf[pos + 1], buf[pos + 2]]) as usize;
  if pos + 3 + name_len > buf.len() {
    return Err(SniError::Overflow);
  }
  Ok(String::from_utf8_lossy(&buf[pos + 3..pos + 3 + name_len]).into_owned())
}

/// Attempts an in-place-equivalent rewrite of the SNI extension. Only
/// succeeds when `new.len()` equals the original name's length — otherwise
/// the caller must choose plaintext forwarding or MITM (spec §4.E).
pub fn try_modify_sni(buf: &[u8], new: &str) -> Option<Vec<u8>> {
  let pos = find_sni_pos(buf).ok()?;
  if pos + 3 > buf.len() {
    return None;
  }
  let name_len = u16::from_be_bytes([buf[pos + 1], buf[pos + 2]]) as usize;
  if new.len() != name_len {
    return None;
  }
  let mut out = buf.to_vec();
  out[pos + 3..pos + 3 + name_len].copy_from_slice(new.as_bytes());
  Some(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Builds a minimal, well-formed TLS 1.2 ClientHello record carrying a
  /// single server_name extension, with empty session id, cipher suites and
  /// compression methods lists, so offsets are easy to reason about.
  fn build_client_hello(sni: &str) -> Vec<u8> {
    let mut hs_body = Vec::new();
    hs_body.extend_from_slice(&[0x03, 0x03]); // client_version
    hs_body.extend_from_slice(&[0u8; 32]); // random
    hs_body.push(0); // session_id_len
    hs_body.extend_from_slice(&[0x00, 0x00]); // cipher_suites_len
    hs_body.push(0); // compression_methods_len

    let mut sni_ext_payload = Vec::new();
    let name_entry_len = 1 + 2 + sni.len();
    sni_ext_payload.extend_from_slice(&(name_entry_len as u16).to_be_bytes()); // server_name_list length
    sni_ext_payload.push(0x00); // name_type = host_name
    sni_ext_payload.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    sni_ext_payload.extend_from_slice(sni.as_bytes());

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&[0x00, 0x00]); // extension type = server_name
    extensions.extend_from_slice(&(sni_ext_payload.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_ext_payload);

    hs_body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hs_body.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(0x01); // ClientHello
    let body_len = hs_body.len() as u32;
    handshake.extend_from_slice(&body_len.to_be_bytes()[1..]); // 3-byte length
    handshake.extend_from_slice(&hs_body);

    let mut record = Vec::new();
    record.push(0x16); // handshake record
    record.extend_from_slice(&[0x03, 0x01]); // record version
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
  }

  #[test]
  fn round_trip_parse() {
    let buf = build_client_hello("example.com");
    assert_eq!(parse_sni(&buf).unwrap(), "example.com");
  }

  #[test]
  fn round_trip_equal_length_rewrite() {
    let buf = build_client_hello("example.com");
    let rewritten = try_modify_sni(&buf, "exampleB.com").unwrap();
    assert_eq!(rewritten.len(), buf.len());
    assert_eq!(parse_sni(&rewritten).unwrap(), "exampleB.com");
  }

  #[test]
  fn rewrite_refuses_length_mismatch() {
    let buf = build_client_hello("example.com");
    assert!(try_modify_sni(&buf, "short.com").is_none());
  }

  #[test]
  fn short_buffer_fails_cleanly() {
    assert_eq!(parse_sni(&[0x16, 0x03, 0x01]), Err(SniError::TooShort));
  }

  #[test]
  fn missing_extension_is_reported() {
    // A ClientHello with no extensions block at all.
    let mut hs_body = Vec::new();
    hs_body.extend_from_slice(&[0x03, 0x03]);
    hs_body.extend_from_slice(&[0u8; 32]);
    hs_body.push(0);
    hs_body.extend_from_slice(&[0x00, 0x00]);
    hs_body.push(0);
    hs_body.extend_from_slice(&[0x00, 0x00]); // extensions_len = 0

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(hs_body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hs_body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);

    assert_eq!(parse_sni(&record), Err(SniError::NotFound));
  }
}
