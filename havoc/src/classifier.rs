use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::io::AsyncReadExt;

use crate::request_handler::handle_request;
use crate::server::ServerState;
use crate::util::capture_stream::{CaptureStream, ReceivedData};
use crate::util::client_hello::TlsFingerprint;
use crate::util::frame_tap::{FrameTap, FrameTapHandle, HTTP2_PREFACE};
use crate::util::rewind_stream::{BoxedRwStream, RewindStream};

/// Facts about a connection gathered while it moves between protocol layers.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
  pub remote_addr: SocketAddr,
  pub local_addr: SocketAddr,
  pub proxy_source: Option<SocketAddr>,
  pub encrypted: bool,
  pub alpn: Option<String>,
  pub fingerprint: Option<TlsFingerprint>,
}

impl ConnectionInfo {
  pub fn new(remote_addr: SocketAddr, local_addr: SocketAddr) -> Self {
    Self {
      remote_addr,
      local_addr,
      proxy_source: None,
      encrypted: false,
      alpn: None,
      fingerprint: None,
    }
  }
}

/// The per-connection context handed to request handlers, owned here rather
/// than attached to any socket type.
pub struct ConnectionContext {
  pub info: ConnectionInfo,
  pub received_data: ReceivedData,
  pub frame_tap: Option<FrameTapHandle>,
  pub pipelining: AtomicBool,
}

impl ConnectionContext {
  /// The client's source IP: the PROXY protocol source when present, else
  /// the socket peer, with any IPv4-mapped prefix stripped.
  pub fn origin_ip(&self) -> String {
    let ip = self.info.proxy_source.map(|address| address.ip()).unwrap_or(self.info.remote_addr.ip());
    let text = ip.to_string();
    text.strip_prefix("::ffff:").map(String::from).unwrap_or(text)
  }
}

#[derive(Debug, PartialEq, Eq)]
enum Classification {
  NeedMoreData,
  Tls,
  Http2,
  Http1,
  Reject,
}

/// How many bytes of an HTTP method token we accept before a space.
const MAX_METHOD_LENGTH: usize = 16;

fn classify_bytes(buffer: &[u8]) -> Classification {
  if buffer.is_empty() {
    return Classification::NeedMoreData;
  }
  if buffer[0] == 0x16 {
    return Classification::Tls;
  }

  let preface_compared = buffer.len().min(HTTP2_PREFACE.len());
  if buffer[..preface_compared] == HTTP2_PREFACE[..preface_compared] {
    return if preface_compared == HTTP2_PREFACE.len() {
      Classification::Http2
    } else {
      Classification::NeedMoreData
    };
  }

  // Anything shaped like "<METHOD> " is handed to the HTTP/1 parser
  for (index, byte) in buffer.iter().copied().enumerate().take(MAX_METHOD_LENGTH + 1) {
    match byte {
      b' ' if index > 0 => return Classification::Http1,
      b'A'..=b'Z' | b'-' => continue,
      _ => return Classification::Reject,
    }
  }
  if buffer.len() <= MAX_METHOD_LENGTH {
    Classification::NeedMoreData
  } else {
    Classification::Reject
  }
}

/// Classifies a stream by its first bytes and hands it to the TLS listener,
/// the HTTP/2 server (below a frame tap), or the HTTP/1 server.
///
/// The peeked bytes are pushed back so downstream parsers observe the stream
/// from offset zero. The TLS listener calls back in with the decrypted
/// stream, so classification must tolerate re-entry.
pub fn classify_connection(
  mut stream: BoxedRwStream,
  info: ConnectionInfo,
  state: Arc<ServerState>,
) -> BoxFuture<'static, ()> {
  Box::pin(async move {
    let mut peeked: Vec<u8> = Vec::new();
    loop {
      match classify_bytes(&peeked) {
        Classification::NeedMoreData => {
          let mut chunk = [0u8; 1024];
          match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(read) => peeked.extend_from_slice(&chunk[..read]),
          }
        }
        Classification::Tls => {
          let rewound = Box::new(RewindStream::new(Bytes::from(peeked), stream));
          crate::tls_listener::handle_tls_connection(rewound, info, state).await;
          return;
        }
        Classification::Http2 => {
          serve_http2(RewindStream::new(Bytes::from(peeked), stream), info, state).await;
          return;
        }
        Classification::Http1 => {
          serve_http1(RewindStream::new(Bytes::from(peeked), stream), info, state).await;
          return;
        }
        Classification::Reject => return,
      }
    }
  })
}

async fn serve_http1(stream: RewindStream<BoxedRwStream>, info: ConnectionInfo, state: Arc<ServerState>) {
  let received_data: ReceivedData = Default::default();
  let context = Arc::new(ConnectionContext {
    info,
    received_data: received_data.clone(),
    frame_tap: None,
    pipelining: AtomicBool::new(false),
  });

  let io = TokioIo::new(CaptureStream::new(stream, received_data));
  let state_for_service = state.clone();
  let service = service_fn(move |request| handle_request(request, context.clone(), state_for_service.clone()));

  let mut http1_builder = hyper::server::conn::http1::Builder::new();
  http1_builder.timer(TokioTimer::new());
  if let Err(error) = http1_builder.serve_connection(io, service).with_upgrades().await {
    state.error_logger.log(&format!("Error serving HTTP/1 connection: {error}")).await;
  }
}

async fn serve_http2(stream: RewindStream<BoxedRwStream>, info: ConnectionInfo, state: Arc<ServerState>) {
  let tap = FrameTap::new(stream);
  let context = Arc::new(ConnectionContext {
    info,
    received_data: Default::default(),
    frame_tap: Some(tap.handle()),
    pipelining: AtomicBool::new(false),
  });

  let io = TokioIo::new(tap);
  let state_for_service = state.clone();
  let service = service_fn(move |request| handle_request(request, context.clone(), state_for_service.clone()));

  let mut http2_builder = hyper::server::conn::http2::Builder::new(TokioExecutor::new());
  http2_builder.timer(TokioTimer::new());
  if let Err(error) = http2_builder.serve_connection(io, service).await {
    state.error_logger.log(&format!("Error serving HTTP/2 connection: {error}")).await;
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) fn test_connection_context() -> ConnectionContext {
    ConnectionContext {
      info: ConnectionInfo::new("203.0.113.7:1234".parse().unwrap(), "10.0.0.1:443".parse().unwrap()),
      received_data: Default::default(),
      frame_tap: None,
      pipelining: AtomicBool::new(false),
    }
  }

  #[test]
  fn test_tls_detected_from_first_byte() {
    assert_eq!(classify_bytes(&[0x16]), Classification::Tls);
    assert_eq!(classify_bytes(&[0x16, 0x03, 0x01]), Classification::Tls);
  }

  #[test]
  fn test_http2_preface_needs_all_24_bytes() {
    assert_eq!(classify_bytes(&HTTP2_PREFACE[..10]), Classification::NeedMoreData);
    assert_eq!(classify_bytes(HTTP2_PREFACE), Classification::Http2);
  }

  #[test]
  fn test_pri_without_full_preface_is_http1() {
    // Diverges from the preface at the version, so it's a plain method line
    assert_eq!(classify_bytes(b"PRI * HTTP/1.1\r\n"), Classification::Http1);
  }

  #[test]
  fn test_method_lines_are_http1() {
    assert_eq!(classify_bytes(b"GET / HTTP/1.1\r\n"), Classification::Http1);
    assert_eq!(classify_bytes(b"DELETE /x"), Classification::Http1);
    assert_eq!(classify_bytes(b"CUSTOM-METHOD /x"), Classification::Http1);
  }

  #[test]
  fn test_partial_method_waits_for_more() {
    assert_eq!(classify_bytes(b"GE"), Classification::NeedMoreData);
    assert_eq!(classify_bytes(b""), Classification::NeedMoreData);
  }

  #[test]
  fn test_garbage_is_rejected() {
    assert_eq!(classify_bytes(b"\x00\x01\x02"), Classification::Reject);
    assert_eq!(classify_bytes(b"lowercase request"), Classification::Reject);
    assert_eq!(classify_bytes(b"TOOLONGMETHODNAMEXX"), Classification::Reject);
  }

  #[test]
  fn test_origin_ip_prefers_proxy_source_and_strips_mapped_prefix() {
    let mut context = test_connection_context();
    assert_eq!(context.origin_ip(), "203.0.113.7");

    context.info.proxy_source = Some("198.51.100.2:9999".parse().unwrap());
    assert_eq!(context.origin_ip(), "198.51.100.2");

    context.info.proxy_source = None;
    context.info.remote_addr = "[::ffff:192.0.2.1]:80".parse().unwrap();
    assert_eq!(context.origin_ip(), "192.0.2.1");
  }
}
