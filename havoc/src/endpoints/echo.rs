use std::error::Error;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Response, StatusCode, Version};

use super::{EndpointRequest, HandlerResponse, HttpEndpoint, HttpResponse, MatchOutcome, PathEndpoint};
use crate::util::capture_stream::received_data_bytes;

/// `/echo`: reflects the request at the rawest level available.
///
/// On HTTP/1 the connection's captured bytes are echoed verbatim; a request
/// that arrived pipelined behind another is refused. On HTTP/2 the response
/// is NDJSON frame telemetry from the connection's frame tap.
pub struct EchoEndpoint;

impl PathEndpoint for EchoEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    if path == "/echo" {
      MatchOutcome::Match
    } else {
      MatchOutcome::NoMatch
    }
  }
}

#[async_trait]
impl HttpEndpoint for EchoEndpoint {
  async fn handle(&self, request: &EndpointRequest<'_>) -> Result<HandlerResponse, Box<dyn Error + Send + Sync>> {
    let response = if request.parts.version == Version::HTTP_2 {
      echo_http2_frames(request)?
    } else {
      echo_raw_request(request)?
    };
    Ok(HandlerResponse::Response(response))
  }

  fn uses_frame_tap(&self) -> bool {
    true
  }
}

/// Computes how many captured bytes belong to the current request: the head
/// up to the blank line plus the declared body length.
fn expected_request_length(captured: &[u8], content_length: usize) -> Option<usize> {
  captured
    .windows(4)
    .position(|window| window == b"\r\n\r\n")
    .map(|head_end| head_end + 4 + content_length)
}

fn pipelining_rejection() -> Result<HttpResponse, Box<dyn Error + Send + Sync>> {
  Ok(
    Response::builder()
      .status(StatusCode::BAD_REQUEST)
      .body(
        Full::new(Bytes::from("Pipelined requests cannot be echoed reliably\n"))
          .map_err(|e| match e {})
          .boxed(),
      )?,
  )
}

fn echo_raw_request(request: &EndpointRequest<'_>) -> Result<HttpResponse, Box<dyn Error + Send + Sync>> {
  // Once pipelining is seen on a socket, every later echo is refused too
  if request.connection.pipelining.load(Ordering::Relaxed) {
    return pipelining_rejection();
  }

  let captured = received_data_bytes(&request.connection.received_data);
  let content_length = request
    .parts
    .headers
    .get(header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<usize>().ok())
    .unwrap_or(0);

  let expected = expected_request_length(&captured, content_length).unwrap_or(captured.len());
  if captured.len() > expected {
    // More bytes than this request arrived before the response went out
    request.connection.pipelining.store(true, Ordering::Relaxed);
    return pipelining_rejection();
  }

  let mut echoed = captured;
  echoed.truncate(expected);
  Ok(
    Response::builder()
      .status(StatusCode::OK)
      .header(header::CONTENT_TYPE, "application/octet-stream")
      .body(Full::new(Bytes::from(echoed)).map_err(|e| match e {}).boxed())?,
  )
}

fn echo_http2_frames(request: &EndpointRequest<'_>) -> Result<HttpResponse, Box<dyn Error + Send + Sync>> {
  let Some(tap) = &request.connection.frame_tap else {
    let response = Response::builder()
      .status(StatusCode::INTERNAL_SERVER_ERROR)
      .body(
        Full::new(Bytes::from(
          "No HTTP/2 frame tap is attached to this connection, so frames cannot be echoed\n",
        ))
        .map_err(|e| match e {})
        .boxed(),
      )?;
    return Ok(response);
  };

  let stream_id = tap.claim_stream(request.parts.method.as_str(), request.parts.uri.path());
  let (global_frames, stream_frames, mut receiver) = tap.subscribe(stream_id.unwrap_or(0));

  let mut records: Vec<std::sync::Arc<crate::util::frame_tap::FrameRecord>> = global_frames;
  records.extend(stream_frames);
  // Drain anything already dispatched but not yet observed
  while let Ok(record) = receiver.try_recv() {
    records.push(record);
  }
  tap.remove(stream_id.unwrap_or(0));

  let mut body = String::new();
  for record in records {
    body.push_str(&record.to_json().to_string());
    body.push('\n');
  }

  Ok(
    Response::builder()
      .status(StatusCode::OK)
      .header(header::CONTENT_TYPE, "application/x-ndjson")
      .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())?,
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_expected_length_covers_head_and_body() {
    let captured = b"PUT /echo HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello";
    let expected = expected_request_length(captured, 5).unwrap();
    assert_eq!(expected, captured.len());
  }

  #[test]
  fn test_pipelined_second_request_is_detectable() {
    let captured = b"GET /echo HTTP/1.1\r\nhost: x\r\n\r\nGET /echo HTTP/1.1\r\nhost: x\r\n\r\n";
    let expected = expected_request_length(captured, 0).unwrap();
    assert!(captured.len() > expected);
  }

  #[test]
  fn test_incomplete_head_has_no_expected_length() {
    assert_eq!(expected_request_length(b"GET /echo HT", 0), None);
  }
}
