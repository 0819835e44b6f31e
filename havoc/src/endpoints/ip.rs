use std::error::Error;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Response, StatusCode};
use serde_json::json;

use super::{EndpointRequest, HandlerResponse, HttpEndpoint, MatchOutcome, PathEndpoint};

/// `/ip`: the client's source address, preferring the PROXY protocol source
/// when one was surfaced.
pub struct IpEndpoint;

impl PathEndpoint for IpEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    if path == "/ip" {
      MatchOutcome::Match
    } else {
      MatchOutcome::NoMatch
    }
  }
}

#[async_trait]
impl HttpEndpoint for IpEndpoint {
  async fn handle(&self, request: &EndpointRequest<'_>) -> Result<HandlerResponse, Box<dyn Error + Send + Sync>> {
    let body = format!("{}\n", serde_json::to_string_pretty(&json!({ "origin": request.connection.origin_ip() }))?);
    let response = Response::builder()
      .status(StatusCode::OK)
      .header(header::CONTENT_TYPE, "application/json")
      .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())?;
    Ok(HandlerResponse::Response(response))
  }
}
