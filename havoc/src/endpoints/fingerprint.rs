use std::error::Error;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Response, StatusCode};
use serde_json::json;

use super::{EndpointRequest, HandlerResponse, HttpEndpoint, MatchOutcome, PathEndpoint};

/// `/fingerprint`: the JA3 and JA4 fingerprints of the connection's TLS
/// ClientHello, along with what the hello offered and what the handshake
/// settled on. Only meaningful on TLS connections.
pub struct FingerprintEndpoint;

impl PathEndpoint for FingerprintEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    if path == "/fingerprint" {
      MatchOutcome::Match
    } else {
      MatchOutcome::NoMatch
    }
  }
}

#[async_trait]
impl HttpEndpoint for FingerprintEndpoint {
  async fn handle(&self, request: &EndpointRequest<'_>) -> Result<HandlerResponse, Box<dyn Error + Send + Sync>> {
    let response = match &request.connection.info.fingerprint {
      Some(fingerprint) => {
        let body = format!(
          "{}\n",
          serde_json::to_string_pretty(&json!({
            "alpn_negotiated": request.connection.info.alpn,
            "alpn_offered": fingerprint.alpn,
            "ja3": fingerprint.ja3,
            "ja3_text": fingerprint.ja3_text,
            "ja4": fingerprint.ja4,
            "server_name": fingerprint.server_name,
          }))?
        );
        Response::builder()
          .status(StatusCode::OK)
          .header(header::CONTENT_TYPE, "application/json")
          .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())?
      }
      None => Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from("No TLS fingerprint for this connection\n")).map_err(|e| match e {}).boxed())?,
    };
    Ok(HandlerResponse::Response(response))
  }
}
