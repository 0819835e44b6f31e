use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

/// The maximum length of a v1 header in bytes, including CRLF.
const V1_MAX_LENGTH: usize = 109;
/// The length of the fixed part of a v2 header in bytes.
const V2_HEADER_LENGTH: usize = 16;
/// The maximum v2 address block length accepted.
const V2_MAX_ADDRESS_LENGTH: usize = 216;
/// The most header bytes buffered before the connection is destroyed.
const MAX_BUFFERED: usize = 512;

/// The outcome of PROXY protocol inspection on a connection's first bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum ProxyHeader {
  /// The stream does not start with a PROXY header; nothing was consumed.
  None,
  /// A header was consumed. Addresses are absent for UNKNOWN/LOCAL headers
  /// and for headers with malformed address fields.
  Stripped {
    source: Option<SocketAddr>,
    destination: Option<SocketAddr>,
  },
}

#[derive(PartialEq, Eq)]
enum Detection {
  None,
  V1,
  V2,
  Incomplete,
}

fn detect(buffer: &[u8]) -> Detection {
  let v1_signature = ppp::v1::PROTOCOL_PREFIX.as_bytes();
  let v2_signature = ppp::v2::PROTOCOL_PREFIX;
  for (signature, detection) in [(v1_signature, Detection::V1), (v2_signature, Detection::V2)] {
    let compared = buffer.len().min(signature.len());
    if buffer[..compared] == signature[..compared] {
      return if compared == signature.len() {
        detection
      } else {
        Detection::Incomplete
      };
    }
  }
  Detection::None
}

/// Reads a PROXY protocol header from the stream, if one is present.
///
/// `buffer` holds bytes already peeked from the stream; more are read as
/// needed. On return the buffer holds exactly the bytes following the header
/// (or the untouched original bytes when no header was present). An error
/// destroys the connection.
pub async fn read_proxy_header<S>(stream: &mut S, buffer: &mut Vec<u8>) -> std::io::Result<ProxyHeader>
where
  S: AsyncRead + Unpin,
{
  loop {
    match detect(buffer) {
      Detection::None => return Ok(ProxyHeader::None),
      Detection::Incomplete => {
        if read_more(stream, buffer).await? == 0 {
          // EOF on a partial signature; nothing to strip
          return Ok(ProxyHeader::None);
        }
      }
      Detection::V1 => return read_v1_header(stream, buffer).await,
      Detection::V2 => return read_v2_header(stream, buffer).await,
    }
  }
}

async fn read_more<S>(stream: &mut S, buffer: &mut Vec<u8>) -> std::io::Result<usize>
where
  S: AsyncRead + Unpin,
{
  if buffer.len() >= MAX_BUFFERED {
    return Err(std::io::Error::new(
      std::io::ErrorKind::InvalidData,
      "PROXY protocol header is too long",
    ));
  }
  let mut chunk = [0u8; 256];
  let read = stream.read(&mut chunk).await?;
  buffer.extend_from_slice(&chunk[..read]);
  Ok(read)
}

async fn read_v1_header<S>(stream: &mut S, buffer: &mut Vec<u8>) -> std::io::Result<ProxyHeader>
where
  S: AsyncRead + Unpin,
{
  let header_end = loop {
    if let Some(position) = buffer.windows(2).position(|pair| pair == b"\r\n") {
      if position + 2 > V1_MAX_LENGTH {
        // Terminator beyond the v1 bound; not a PROXY header after all
        return Ok(ProxyHeader::None);
      }
      break position + 2;
    }
    if buffer.len() >= V1_MAX_LENGTH {
      // No CRLF within the bound; pass all buffered bytes through untouched
      return Ok(ProxyHeader::None);
    }
    if read_more(stream, buffer).await? == 0 {
      return Ok(ProxyHeader::None);
    }
  };

  let header: Vec<u8> = buffer.drain(..header_end).collect();
  let line = match std::str::from_utf8(&header[ppp::v1::PROTOCOL_PREFIX.len()..header.len() - 2]) {
    Ok(line) => line,
    Err(_) => return Ok(stripped_without_addresses()),
  };

  Ok(parse_v1_fields(line))
}

fn stripped_without_addresses() -> ProxyHeader {
  ProxyHeader::Stripped {
    source: None,
    destination: None,
  }
}

fn parse_v1_fields(line: &str) -> ProxyHeader {
  let mut fields = line.split(' ');
  let protocol = fields.next().unwrap_or("");

  if protocol == "UNKNOWN" {
    // The rest of an UNKNOWN line is ignored by definition
    return stripped_without_addresses();
  }
  if protocol != "TCP4" && protocol != "TCP6" {
    return stripped_without_addresses();
  }

  let (source_address, destination_address, source_port, destination_port) =
    match (fields.next(), fields.next(), fields.next(), fields.next(), fields.next()) {
      (Some(src), Some(dst), Some(src_port), Some(dst_port), None) => (src, dst, src_port, dst_port),
      _ => return stripped_without_addresses(),
    };

  let source_port: u16 = match source_port.parse() {
    Ok(port) => port,
    Err(_) => return stripped_without_addresses(),
  };
  let destination_port: u16 = match destination_port.parse() {
    Ok(port) => port,
    Err(_) => return stripped_without_addresses(),
  };

  let (source_ip, destination_ip) = if protocol == "TCP4" {
    match (parse_v1_ipv4(source_address), parse_v1_ipv4(destination_address)) {
      (Some(src), Some(dst)) => (IpAddr::V4(src), IpAddr::V4(dst)),
      _ => return stripped_without_addresses(),
    }
  } else {
    match (parse_v1_ipv6(source_address), parse_v1_ipv6(destination_address)) {
      (Some(src), Some(dst)) => (IpAddr::V6(src), IpAddr::V6(dst)),
      _ => return stripped_without_addresses(),
    }
  };

  ProxyHeader::Stripped {
    source: Some(SocketAddr::new(source_ip, source_port)),
    destination: Some(SocketAddr::new(destination_ip, destination_port)),
  }
}

fn parse_v1_ipv4(address: &str) -> Option<Ipv4Addr> {
  let mut octets = [0u8; 4];
  let mut parts = address.split('.');
  for octet in octets.iter_mut() {
    let part = parts.next()?;
    if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
      return None;
    }
    if part.len() > 1 && part.starts_with('0') {
      return None;
    }
    *octet = part.parse().ok()?;
  }
  if parts.next().is_some() {
    return None;
  }
  Some(Ipv4Addr::from(octets))
}

fn parse_v1_ipv6(address: &str) -> Option<Ipv6Addr> {
  if address.len() > 45 || !address.bytes().all(|b| b.is_ascii_hexdigit() || b == b':') {
    return None;
  }
  address.parse().ok()
}

async fn read_v2_header<S>(stream: &mut S, buffer: &mut Vec<u8>) -> std::io::Result<ProxyHeader>
where
  S: AsyncRead + Unpin,
{
  while buffer.len() < V2_HEADER_LENGTH {
    if read_more(stream, buffer).await? == 0 {
      return Err(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "Truncated PROXY protocol v2 header",
      ));
    }
  }

  let version_command = buffer[12];
  let family_transport = buffer[13];
  let address_length = u16::from_be_bytes([buffer[14], buffer[15]]) as usize;

  if address_length > V2_MAX_ADDRESS_LENGTH {
    return Err(std::io::Error::new(
      std::io::ErrorKind::InvalidData,
      "PROXY protocol v2 address block too long",
    ));
  }

  let total_length = V2_HEADER_LENGTH + address_length;
  while buffer.len() < total_length {
    if read_more(stream, buffer).await? == 0 {
      return Err(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "Truncated PROXY protocol v2 header",
      ));
    }
  }

  let header: Vec<u8> = buffer.drain(..total_length).collect();
  let addresses = &header[V2_HEADER_LENGTH..];

  if version_command >> 4 != 2 {
    return Err(std::io::Error::new(
      std::io::ErrorKind::InvalidData,
      "Unsupported PROXY protocol v2 version",
    ));
  }

  let command = version_command & 0x0f;
  let family = family_transport >> 4;
  let transport = family_transport & 0x0f;

  // LOCAL commands and non-STREAM transports strip without surfacing addresses
  if command != 1 || transport != 1 {
    return Ok(stripped_without_addresses());
  }

  match family {
    // AF_INET: 4 + 4 address bytes, 2 + 2 port bytes
    1 if addresses.len() >= 12 => {
      let source_ip = Ipv4Addr::new(addresses[0], addresses[1], addresses[2], addresses[3]);
      let destination_ip = Ipv4Addr::new(addresses[4], addresses[5], addresses[6], addresses[7]);
      let source_port = u16::from_be_bytes([addresses[8], addresses[9]]);
      let destination_port = u16::from_be_bytes([addresses[10], addresses[11]]);
      Ok(ProxyHeader::Stripped {
        source: Some(SocketAddr::new(IpAddr::V4(source_ip), source_port)),
        destination: Some(SocketAddr::new(IpAddr::V4(destination_ip), destination_port)),
      })
    }
    // AF_INET6: 16 + 16 address bytes, 2 + 2 port bytes
    2 if addresses.len() >= 36 => {
      let mut source_octets = [0u8; 16];
      source_octets.copy_from_slice(&addresses[0..16]);
      let mut destination_octets = [0u8; 16];
      destination_octets.copy_from_slice(&addresses[16..32]);
      let source_port = u16::from_be_bytes([addresses[32], addresses[33]]);
      let destination_port = u16::from_be_bytes([addresses[34], addresses[35]]);
      Ok(ProxyHeader::Stripped {
        source: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(source_octets)), source_port)),
        destination: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(destination_octets)), destination_port)),
      })
    }
    _ => Ok(stripped_without_addresses()),
  }
}
