use std::error::Error;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};

use super::{EndpointRequest, HandlerResponse, HttpEndpoint, MatchOutcome, PathEndpoint};

/// `/status/<code>`: answers with the given status code. A non-numeric code
/// is a structured 400 from `match_path`, not a 404.
pub struct StatusEndpoint;

fn parse_code(path: &str) -> Option<Result<u16, String>> {
  let code = path.strip_prefix("/status/")?;
  match code.parse::<u16>() {
    Ok(code) if (100..=599).contains(&code) => Some(Ok(code)),
    _ => Some(Err(format!("Invalid status code \"{code}\""))),
  }
}

impl PathEndpoint for StatusEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    match parse_code(path) {
      Some(Ok(_)) => MatchOutcome::Match,
      Some(Err(message)) => MatchOutcome::Error { status: 400, message },
      None => MatchOutcome::NoMatch,
    }
  }
}

#[async_trait]
impl HttpEndpoint for StatusEndpoint {
  async fn handle(&self, request: &EndpointRequest<'_>) -> Result<HandlerResponse, Box<dyn Error + Send + Sync>> {
    let code = match parse_code(request.matched_path) {
      Some(Ok(code)) => code,
      _ => Err(anyhow::anyhow!("Status endpoint invoked with an unmatched path"))?,
    };
    let status = StatusCode::from_u16(code)?;
    let body = if status.canonical_reason().is_some() && !status.is_informational() && status != StatusCode::NO_CONTENT {
      Bytes::from(format!("{}\n", status.canonical_reason().unwrap_or_default()))
    } else {
      Bytes::new()
    };
    let response = Response::builder()
      .status(status)
      .body(Full::new(body).map_err(|e| match e {}).boxed())?;
    Ok(HandlerResponse::Response(response))
  }
}
