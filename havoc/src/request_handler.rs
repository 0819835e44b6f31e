use std::convert::Infallible;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::{header, HeaderMap, Method, Request, Response, StatusCode, Version};

use crate::classifier::ConnectionContext;
use crate::endpoints::{resolve_endpoint_chain, EndpointRequest, HandlerResponse, HttpResponse};
use crate::server::ServerState;
use crate::util::capture_stream::clear_received_data;

/// The most request body the routed endpoints will buffer.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

pub fn plain_response(status: StatusCode, body: &str) -> HttpResponse {
  Response::builder()
    .status(status)
    .header(header::CONTENT_TYPE, "text/plain")
    .body(Full::new(Bytes::from(body.to_string())).map_err(|e| match e {}).boxed())
    .unwrap_or_default()
}

/// Handles one HTTP/1 or HTTP/2 request: anti-abuse filtering, ACME
/// challenge answers, the landing redirect, CORS, and endpoint dispatch.
pub async fn handle_request(
  request: Request<Incoming>,
  context: Arc<ConnectionContext>,
  state: Arc<ServerState>,
) -> Result<HttpResponse, Infallible> {
  let response = match handle_request_inner(request, &context, &state).await {
    Ok(response) => response,
    Err(error) => {
      state.error_logger.log(&format!("HTTP handler failed: {error}")).await;
      plain_response(StatusCode::INTERNAL_SERVER_ERROR, "HTTP handler failed\n")
    }
  };

  // Request boundary: keep-alive sockets must not accumulate history
  clear_received_data(&context.received_data);
  Ok(response)
}

async fn handle_request_inner(
  mut request: Request<Incoming>,
  context: &Arc<ConnectionContext>,
  state: &Arc<ServerState>,
) -> Result<HttpResponse, Box<dyn std::error::Error + Send + Sync>> {
  // Absolute-form requests are relayed proxy traffic unless they target us
  if request.version() <= Version::HTTP_11 && request.uri().scheme().is_some() {
    let targets_us = request
      .uri()
      .host()
      .map(|host| hostname_in_root_domain(host, &state.options.root_domain))
      .unwrap_or(false);
    if !targets_us {
      let mut response = plain_response(StatusCode::BAD_REQUEST, "This server does not proxy requests\n");
      response
        .headers_mut()
        .insert(header::CONNECTION, header::HeaderValue::from_static("close"));
      return Ok(response);
    }
  }

  let path = request.uri().path().to_string();
  let query = request.uri().query().map(String::from);

  if let Some(token) = path.strip_prefix("/.well-known/acme-challenge/") {
    let key_authorization = state.acme.as_ref().and_then(|acme| acme.challenge_response(token));
    return Ok(match key_authorization {
      Some(key_authorization) => plain_response(StatusCode::OK, &key_authorization),
      None => plain_response(StatusCode::NOT_FOUND, "Unknown ACME challenge token\n"),
    });
  }

  let hostname = request_hostname(&request);
  let hostname_prefix = hostname.as_deref().and_then(|h| state.options.hostname_prefix(h)).map(String::from);

  if path == "/" && matches!(hostname_prefix.as_deref(), None | Some("www")) {
    let response = Response::builder()
      .status(StatusCode::TEMPORARY_REDIRECT)
      .header(header::LOCATION, state.options.landing_url.as_str())
      .body(Full::new(Bytes::new()).map_err(|e| match e {}).boxed())?;
    return Ok(response);
  }

  let cors = cors_headers(request.headers());

  if request.method() == Method::OPTIONS {
    let mut response = plain_response(StatusCode::OK, "");
    apply_extra_headers(&mut response, &cors);
    return Ok(response);
  }

  if hyper_tungstenite::is_upgrade_request(&request) {
    return crate::websocket_handler::handle_upgrade(&mut request, context, state, &path, hostname_prefix.as_deref()).await;
  }

  let chain = match resolve_endpoint_chain(&state.http_endpoints, &path, hostname_prefix.as_deref()) {
    Ok(chain) => chain,
    Err(error) => {
      let status = StatusCode::from_u16(error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
      let mut response = plain_response(status, &format!("{}\n", error.message));
      apply_extra_headers(&mut response, &cors);
      return Ok(response);
    }
  };

  // Without a raw-frame consumer in the chain, frame capture for this stream
  // only wastes memory
  if let Some(tap) = &context.frame_tap {
    if !chain.iter().any(|(endpoint, _)| endpoint.uses_frame_tap()) {
      if let Some(stream_id) = tap.claim_stream(request.method().as_str(), &path) {
        tap.stop_capturing(stream_id);
      }
    }
  }

  let (parts, body) = request.into_parts();
  let body = match Limited::new(body, MAX_BODY_SIZE).collect().await {
    Ok(collected) => collected.to_bytes(),
    Err(_) => {
      let mut response = plain_response(StatusCode::BAD_REQUEST, "Request body too large or truncated\n");
      apply_extra_headers(&mut response, &cors);
      return Ok(response);
    }
  };

  for (endpoint, matched_path) in &chain {
    let endpoint_request = EndpointRequest {
      parts: &parts,
      body: &body,
      matched_path,
      query: query.as_deref(),
      connection: context.as_ref(),
    };
    match endpoint.handle(&endpoint_request).await? {
      HandlerResponse::Response(mut response) => {
        apply_extra_headers(&mut response, &cors);
        return Ok(response);
      }
      HandlerResponse::Continue => continue,
    }
  }

  // Every endpoint in the chain deferred
  let mut response = plain_response(StatusCode::OK, "OK");
  apply_extra_headers(&mut response, &cors);
  Ok(response)
}

fn hostname_in_root_domain(hostname: &str, root_domain: &str) -> bool {
  hostname == root_domain || hostname.ends_with(&format!(".{root_domain}"))
}

/// The request's hostname: the authority for HTTP/2, the Host header for
/// HTTP/1, without any port.
fn request_hostname(request: &Request<Incoming>) -> Option<String> {
  let raw = match request.version() {
    Version::HTTP_2 | Version::HTTP_3 => request
      .uri()
      .host()
      .map(String::from)
      .or_else(|| header_hostname(request.headers())),
    _ => header_hostname(request.headers()),
  }?;
  Some(strip_port(&raw).to_ascii_lowercase())
}

fn header_hostname(headers: &HeaderMap) -> Option<String> {
  headers.get(header::HOST).and_then(|value| value.to_str().ok()).map(String::from)
}

fn strip_port(hostname: &str) -> String {
  if let Some((host, port)) = hostname.rsplit_once(':') {
    if port.parse::<u16>().is_ok() && !host.is_empty() {
      return host.to_string();
    }
  }
  hostname.to_string()
}

/// Computes the CORS response headers: the Origin is echoed back, requests
/// are always credentialed, and preflight Access-Control-Request-* headers
/// are echoed into their Allow counterparts.
fn cors_headers(request_headers: &HeaderMap) -> Vec<(header::HeaderName, header::HeaderValue)> {
  let mut headers = Vec::new();

  let origin = request_headers
    .get(header::ORIGIN)
    .cloned()
    .unwrap_or_else(|| header::HeaderValue::from_static("*"));
  headers.push((header::ACCESS_CONTROL_ALLOW_ORIGIN, origin));
  headers.push((
    header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
    header::HeaderValue::from_static("true"),
  ));

  if let Some(method) = request_headers.get(header::ACCESS_CONTROL_REQUEST_METHOD) {
    headers.push((header::ACCESS_CONTROL_ALLOW_METHODS, method.clone()));
  }
  if let Some(requested) = request_headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
    headers.push((header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone()));
  }
  if let Some(private_network) = request_headers.get("access-control-request-private-network") {
    headers.push((
      header::HeaderName::from_static("access-control-allow-private-network"),
      private_network.clone(),
    ));
  }

  headers
}

fn apply_extra_headers(response: &mut HttpResponse, extra: &[(header::HeaderName, header::HeaderValue)]) {
  for (name, value) in extra {
    response.headers_mut().insert(name.clone(), value.clone());
  }
  if let Ok(date) = header::HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
    response.headers_mut().entry(header::DATE).or_insert(date);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_hostname_in_root_domain() {
    assert!(hostname_in_root_domain("testserver.host", "testserver.host"));
    assert!(hostname_in_root_domain("expired.testserver.host", "testserver.host"));
    assert!(!hostname_in_root_domain("xtestserver.host", "testserver.host"));
    assert!(!hostname_in_root_domain("example.com", "testserver.host"));
  }

  #[test]
  fn test_strip_port() {
    assert_eq!(strip_port("testserver.host:8443"), "testserver.host");
    assert_eq!(strip_port("testserver.host"), "testserver.host");
    assert_eq!(strip_port("not:aport"), "not:aport");
  }

  #[test]
  fn test_cors_echoes_origin_and_preflight_headers() {
    let mut request_headers = HeaderMap::new();
    request_headers.insert(header::ORIGIN, header::HeaderValue::from_static("https://client.example"));
    request_headers.insert(
      header::ACCESS_CONTROL_REQUEST_METHOD,
      header::HeaderValue::from_static("PUT"),
    );
    request_headers.insert(
      header::ACCESS_CONTROL_REQUEST_HEADERS,
      header::HeaderValue::from_static("x-custom"),
    );

    let cors = cors_headers(&request_headers);
    let find = |name: &header::HeaderName| {
      cors
        .iter()
        .find(|(candidate, _)| candidate == name)
        .map(|(_, value)| value.to_str().unwrap().to_string())
    };

    assert_eq!(find(&header::ACCESS_CONTROL_ALLOW_ORIGIN), Some("https://client.example".to_string()));
    assert_eq!(find(&header::ACCESS_CONTROL_ALLOW_CREDENTIALS), Some("true".to_string()));
    assert_eq!(find(&header::ACCESS_CONTROL_ALLOW_METHODS), Some("PUT".to_string()));
    assert_eq!(find(&header::ACCESS_CONTROL_ALLOW_HEADERS), Some("x-custom".to_string()));
  }

  #[test]
  fn test_cors_defaults_to_wildcard_origin() {
    let cors = cors_headers(&HeaderMap::new());
    assert!(cors
      .iter()
      .any(|(name, value)| *name == header::ACCESS_CONTROL_ALLOW_ORIGIN && value == "*"));
    assert_eq!(cors.len(), 2);
  }
}
