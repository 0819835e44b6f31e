//! Minimal DER encoding helpers for the OCSP responder.
//!
//! Only the handful of ASN.1 constructs that appear in an OCSP response are
//! supported. Parsing is handled elsewhere by `x509-parser`; this module only
//! writes.

/// Encodes a DER length prefix.
fn write_length(out: &mut Vec<u8>, length: usize) {
  if length < 0x80 {
    out.push(length as u8);
  } else {
    let bytes = length.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
  }
}

/// Encodes a TLV with the given tag around already-encoded content.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(content.len() + 4);
  out.push(tag);
  write_length(&mut out, content.len());
  out.extend_from_slice(content);
  out
}

/// Encodes a SEQUENCE from concatenated child encodings.
pub fn sequence(children: &[&[u8]]) -> Vec<u8> {
  tlv(0x30, &children.concat())
}

/// Encodes a context-specific, constructed (EXPLICIT) tag.
pub fn explicit(tag_number: u8, content: &[u8]) -> Vec<u8> {
  tlv(0xa0 | tag_number, content)
}

/// Encodes an OBJECT IDENTIFIER from its dotted components.
pub fn oid(components: &[u64]) -> Vec<u8> {
  let mut content = vec![(components[0] * 40 + components[1]) as u8];
  for &component in &components[2..] {
    let mut stack = Vec::new();
    let mut value = component;
    stack.push((value & 0x7f) as u8);
    value >>= 7;
    while value > 0 {
      stack.push(0x80 | (value & 0x7f) as u8);
      value >>= 7;
    }
    stack.reverse();
    content.extend_from_slice(&stack);
  }
  tlv(0x06, &content)
}

/// Encodes an OCTET STRING.
pub fn octet_string(content: &[u8]) -> Vec<u8> {
  tlv(0x04, content)
}

/// Encodes a BIT STRING with zero unused bits.
pub fn bit_string(content: &[u8]) -> Vec<u8> {
  let mut padded = Vec::with_capacity(content.len() + 1);
  padded.push(0x00);
  padded.extend_from_slice(content);
  tlv(0x03, &padded)
}

/// Encodes an INTEGER from unsigned big-endian bytes, normalizing the
/// leading-zero and sign-bit rules.
pub fn integer(bytes: &[u8]) -> Vec<u8> {
  let stripped: &[u8] = {
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    if skip == bytes.len() {
      &[0]
    } else {
      &bytes[skip..]
    }
  };
  if stripped[0] & 0x80 != 0 {
    let mut content = Vec::with_capacity(stripped.len() + 1);
    content.push(0x00);
    content.extend_from_slice(stripped);
    tlv(0x02, &content)
  } else {
    tlv(0x02, stripped)
  }
}

/// Encodes an ENUMERATED value.
pub fn enumerated(value: u8) -> Vec<u8> {
  tlv(0x0a, &[value])
}

/// Encodes a NULL.
pub fn null() -> Vec<u8> {
  vec![0x05, 0x00]
}

/// Encodes a GeneralizedTime from a `YYYYMMDDHHMMSSZ` string.
pub fn generalized_time(timestamp: &str) -> Vec<u8> {
  tlv(0x18, timestamp.as_bytes())
}
