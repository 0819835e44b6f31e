use sha2::{Digest, Sha256};

/// A parsed-and-fingerprinted TLS ClientHello.
///
/// Attached to the connection before the handshake so HTTP endpoints can
/// report how the client negotiated. Parsing failures are non-fatal; the
/// connection simply carries no fingerprint.
#[derive(Debug, Clone)]
pub struct TlsFingerprint {
  pub ja3: String,
  pub ja3_text: String,
  pub ja4: String,
  pub server_name: Option<String>,
  pub alpn: Vec<String>,
}

struct ParsedHello {
  client_version: u16,
  ciphers: Vec<u16>,
  extensions: Vec<u16>,
  groups: Vec<u16>,
  point_formats: Vec<u8>,
  signature_algorithms: Vec<u16>,
  supported_versions: Vec<u16>,
  server_name: Option<String>,
  alpn: Vec<String>,
}

/// Returns the total length of the first TLS record once the 5-byte record
/// header is available, so callers know how far to peek.
pub fn required_record_length(buffer: &[u8]) -> Option<usize> {
  if buffer.len() < 5 {
    return None;
  }
  Some(5 + u16::from_be_bytes([buffer[3], buffer[4]]) as usize)
}

/// Fingerprints a ClientHello from the raw bytes of the first TLS record.
pub fn fingerprint_client_hello(record: &[u8]) -> Option<TlsFingerprint> {
  let hello = parse_client_hello(record)?;
  Some(TlsFingerprint {
    ja3: format!("{:x}", md5::compute(ja3_text(&hello).as_bytes())),
    ja3_text: ja3_text(&hello),
    ja4: ja4(&hello),
    server_name: hello.server_name.clone(),
    alpn: hello.alpn.clone(),
  })
}

/// GREASE values are reserved placeholders and excluded from fingerprints.
fn is_grease(value: u16) -> bool {
  value & 0x0f0f == 0x0a0a && (value >> 8) == (value & 0xff)
}

struct Reader<'a> {
  data: &'a [u8],
  position: usize,
}

impl<'a> Reader<'a> {
  fn new(data: &'a [u8]) -> Self {
    Self { data, position: 0 }
  }

  fn take(&mut self, count: usize) -> Option<&'a [u8]> {
    let slice = self.data.get(self.position..self.position + count)?;
    self.position += count;
    Some(slice)
  }

  fn u8(&mut self) -> Option<u8> {
    Some(self.take(1)?[0])
  }

  fn u16(&mut self) -> Option<u16> {
    let bytes = self.take(2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
  }
}

fn parse_client_hello(record: &[u8]) -> Option<ParsedHello> {
  let mut reader = Reader::new(record);

  // TLS record header: handshake content type, legacy version, length
  if reader.u8()? != 0x16 {
    return None;
  }
  reader.take(2)?;
  let record_length = reader.u16()? as usize;
  let mut handshake = Reader::new(reader.take(record_length)?);

  // Handshake header: ClientHello message type and 24-bit length
  if handshake.u8()? != 0x01 {
    return None;
  }
  let body_length =
    ((handshake.u8()? as usize) << 16) | ((handshake.u8()? as usize) << 8) | handshake.u8()? as usize;
  let mut body = Reader::new(handshake.take(body_length)?);

  let client_version = body.u16()?;
  body.take(32)?; // random
  let session_id_length = body.u8()? as usize;
  body.take(session_id_length)?;

  let ciphers_length = body.u16()? as usize;
  let mut ciphers = Vec::with_capacity(ciphers_length / 2);
  let mut cipher_reader = Reader::new(body.take(ciphers_length)?);
  while let Some(cipher) = cipher_reader.u16() {
    ciphers.push(cipher);
  }

  let compression_length = body.u8()? as usize;
  body.take(compression_length)?;

  let mut hello = ParsedHello {
    client_version,
    ciphers,
    extensions: Vec::new(),
    groups: Vec::new(),
    point_formats: Vec::new(),
    signature_algorithms: Vec::new(),
    supported_versions: Vec::new(),
    server_name: None,
    alpn: Vec::new(),
  };

  // Extensions are optional in old hellos
  if let Some(extensions_length) = body.u16() {
    let mut extensions = Reader::new(body.take(extensions_length as usize)?);
    while let Some(extension_type) = extensions.u16() {
      let extension_length = extensions.u16()? as usize;
      let mut extension = Reader::new(extensions.take(extension_length)?);
      hello.extensions.push(extension_type);

      match extension_type {
        // server_name
        0 => {
          extension.u16()?;
          if extension.u8()? == 0 {
            let name_length = extension.u16()? as usize;
            hello.server_name = std::str::from_utf8(extension.take(name_length)?).ok().map(String::from);
          }
        }
        // supported_groups
        10 => {
          let list_length = extension.u16()? as usize;
          let mut list = Reader::new(extension.take(list_length)?);
          while let Some(group) = list.u16() {
            hello.groups.push(group);
          }
        }
        // ec_point_formats
        11 => {
          let list_length = extension.u8()? as usize;
          hello.point_formats.extend_from_slice(extension.take(list_length)?);
        }
        // signature_algorithms
        13 => {
          let list_length = extension.u16()? as usize;
          let mut list = Reader::new(extension.take(list_length)?);
          while let Some(algorithm) = list.u16() {
            hello.signature_algorithms.push(algorithm);
          }
        }
        // application_layer_protocol_negotiation
        16 => {
          let list_length = extension.u16()? as usize;
          let mut list = Reader::new(extension.take(list_length)?);
          while let Some(protocol_length) = list.u8() {
            let protocol = list.take(protocol_length as usize)?;
            if let Ok(protocol) = std::str::from_utf8(protocol) {
              hello.alpn.push(protocol.to_string());
            }
          }
        }
        // supported_versions
        43 => {
          let list_length = extension.u8()? as usize;
          let mut list = Reader::new(extension.take(list_length)?);
          while let Some(version) = list.u16() {
            hello.supported_versions.push(version);
          }
        }
        _ => {}
      }
    }
  }

  Some(hello)
}

fn join_decimal<T: Copy + Into<u32>>(values: &[T], filter_grease: bool) -> String {
  values
    .iter()
    .map(|v| (*v).into())
    .filter(|v| !filter_grease || *v > 0xffff || !is_grease(*v as u16))
    .map(|v| v.to_string())
    .collect::<Vec<_>>()
    .join("-")
}

fn ja3_text(hello: &ParsedHello) -> String {
  format!(
    "{},{},{},{},{}",
    hello.client_version,
    join_decimal(&hello.ciphers, true),
    join_decimal(&hello.extensions, true),
    join_decimal(&hello.groups, true),
    join_decimal(&hello.point_formats, false),
  )
}

fn sha256_12(input: &str) -> String {
  if input.is_empty() {
    return "000000000000".to_string();
  }
  let digest = Sha256::digest(input.as_bytes());
  digest.iter().map(|b| format!("{b:02x}")).collect::<String>()[..12].to_string()
}

fn ja4_version(hello: &ParsedHello) -> &'static str {
  let version = hello
    .supported_versions
    .iter()
    .copied()
    .filter(|v| !is_grease(*v))
    .max()
    .unwrap_or(hello.client_version);
  match version {
    0x0304 => "13",
    0x0303 => "12",
    0x0302 => "11",
    0x0301 => "10",
    0x0300 => "s3",
    _ => "00",
  }
}

fn ja4(hello: &ParsedHello) -> String {
  let ciphers: Vec<u16> = hello.ciphers.iter().copied().filter(|c| !is_grease(*c)).collect();
  let extensions: Vec<u16> = hello.extensions.iter().copied().filter(|e| !is_grease(*e)).collect();

  let alpn_marker = match hello.alpn.first().map(|p| p.as_bytes()) {
    Some([single]) => format!("{}{}", *single as char, *single as char),
    Some([first, .., last]) if first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric() => {
      format!("{}{}", *first as char, *last as char)
    }
    _ => "00".to_string(),
  };

  let ja4_a = format!(
    "t{}{}{:02}{:02}{}",
    ja4_version(hello),
    if hello.server_name.is_some() { "d" } else { "i" },
    ciphers.len().min(99),
    extensions.len().min(99),
    alpn_marker,
  );

  let mut sorted_ciphers: Vec<u16> = ciphers;
  sorted_ciphers.sort_unstable();
  let ja4_b = sha256_12(
    &sorted_ciphers.iter().map(|c| format!("{c:04x}")).collect::<Vec<_>>().join(","),
  );

  let mut sorted_extensions: Vec<u16> = extensions.into_iter().filter(|e| *e != 0 && *e != 16).collect();
  sorted_extensions.sort_unstable();
  let mut ja4_c_input = sorted_extensions.iter().map(|e| format!("{e:04x}")).collect::<Vec<_>>().join(",");
  if !hello.signature_algorithms.is_empty() {
    ja4_c_input.push('_');
    ja4_c_input.push_str(
      &hello
        .signature_algorithms
        .iter()
        .filter(|a| !is_grease(**a))
        .map(|a| format!("{a:04x}"))
        .collect::<Vec<_>>()
        .join(","),
    );
  }
  let ja4_c = sha256_12(&ja4_c_input);

  format!("{ja4_a}_{ja4_b}_{ja4_c}")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn build_hello(server_name: Option<&str>, alpn: &[&str]) -> Vec<u8> {
    let mut extensions = Vec::new();

    if let Some(name) = server_name {
      let mut data = Vec::new();
      data.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
      data.push(0);
      data.extend_from_slice(&(name.len() as u16).to_be_bytes());
      data.extend_from_slice(name.as_bytes());
      push_extension(&mut extensions, 0, &data);
    }

    // supported_groups: x25519, secp256r1
    push_extension(&mut extensions, 10, &[0x00, 0x04, 0x00, 0x1d, 0x00, 0x17]);
    // ec_point_formats: uncompressed
    push_extension(&mut extensions, 11, &[0x01, 0x00]);
    // signature_algorithms: ecdsa_secp256r1_sha256, rsa_pss_rsae_sha256
    push_extension(&mut extensions, 13, &[0x00, 0x04, 0x04, 0x03, 0x08, 0x04]);

    if !alpn.is_empty() {
      let mut list = Vec::new();
      for protocol in alpn {
        list.push(protocol.len() as u8);
        list.extend_from_slice(protocol.as_bytes());
      }
      let mut data = Vec::new();
      data.extend_from_slice(&(list.len() as u16).to_be_bytes());
      data.extend_from_slice(&list);
      push_extension(&mut extensions, 16, &data);
    }

    // supported_versions: TLS 1.3, TLS 1.2
    push_extension(&mut extensions, 43, &[0x04, 0x03, 0x04, 0x03, 0x03]);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // TLS 1.2 legacy version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // empty session id
    body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]); // TLS_AES_128/256
    body.extend_from_slice(&[0x01, 0x00]); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
  }

  fn push_extension(out: &mut Vec<u8>, extension_type: u16, data: &[u8]) {
    out.extend_from_slice(&extension_type.to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
  }

  #[test]
  fn test_required_record_length() {
    assert_eq!(required_record_length(&[0x16, 0x03, 0x01]), None);
    assert_eq!(required_record_length(&[0x16, 0x03, 0x01, 0x00, 0x20]), Some(37));
  }

  #[test]
  fn test_ja3_text_fields() {
    let record = build_hello(Some("example.com"), &["h2", "http/1.1"]);
    let fingerprint = fingerprint_client_hello(&record).unwrap();

    // 771 = 0x0303; ciphers 4865-4866; extensions 0-10-11-13-16-43; groups 29-23; formats 0
    assert_eq!(fingerprint.ja3_text, "771,4865-4866,0-10-11-13-16-43,29-23,0");
    assert_eq!(fingerprint.ja3.len(), 32);
    assert!(fingerprint.ja3.bytes().all(|b| b.is_ascii_hexdigit()));
  }

  #[test]
  fn test_ja4_structure() {
    let record = build_hello(Some("example.com"), &["h2"]);
    let fingerprint = fingerprint_client_hello(&record).unwrap();

    let parts: Vec<&str> = fingerprint.ja4.split('_').collect();
    assert_eq!(parts.len(), 3);
    // TLS 1.3 from supported_versions, SNI present, 2 ciphers, 6 extensions, ALPN "h2"
    assert_eq!(parts[0], "t13d0206h2");
    assert_eq!(parts[1].len(), 12);
    assert_eq!(parts[2].len(), 12);
  }

  #[test]
  fn test_ja4_without_sni_or_alpn() {
    let record = build_hello(None, &[]);
    let fingerprint = fingerprint_client_hello(&record).unwrap();

    assert!(fingerprint.ja4.starts_with("t13i0204"));
    assert!(fingerprint.ja4[8..10].eq("00"));
    assert!(fingerprint.server_name.is_none());
  }

  #[test]
  fn test_server_name_and_alpn_extraction() {
    let record = build_hello(Some("expired.localhost"), &["http/1.1", "h2"]);
    let fingerprint = fingerprint_client_hello(&record).unwrap();

    assert_eq!(fingerprint.server_name.as_deref(), Some("expired.localhost"));
    assert_eq!(fingerprint.alpn, vec!["http/1.1", "h2"]);
  }

  #[test]
  fn test_garbage_is_not_fatal() {
    assert!(fingerprint_client_hello(b"not a tls record at all").is_none());
    assert!(fingerprint_client_hello(&[0x16, 0x03, 0x01, 0x00, 0x05, 0x01, 0x00]).is_none());
  }
}
