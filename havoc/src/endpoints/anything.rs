use std::collections::BTreeMap;
use std::error::Error;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Response, StatusCode};
use serde_json::{json, Value};

use super::{EndpointRequest, HandlerResponse, HttpEndpoint, HttpResponse, MatchOutcome, PathEndpoint};

/// Reflects the request back as a fixed JSON document with keys
/// `{args, data, files, form, headers, json, method, origin, url}`.
pub struct AnythingEndpoint {
  path: &'static str,
  allowed_method: Option<Method>,
  field_filter: Option<&'static [&'static str]>,
}

impl AnythingEndpoint {
  /// The full reflector at `/anything`, any method, every field.
  pub fn anything() -> Self {
    Self {
      path: "/anything",
      allowed_method: None,
      field_filter: None,
    }
  }

  /// A method-restricted reflector like `/get` or `/post`.
  pub fn for_method(path: &'static str, method: Method, field_filter: &'static [&'static str]) -> Self {
    Self {
      path,
      allowed_method: Some(method),
      field_filter: Some(field_filter),
    }
  }

  /// The `/headers` view of the reflector.
  pub fn headers_only() -> Self {
    Self {
      path: "/headers",
      allowed_method: None,
      field_filter: Some(&["headers"]),
    }
  }
}

impl PathEndpoint for AnythingEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    // `/anything` reflects arbitrary subpaths too
    if path == self.path || (self.allowed_method.is_none() && path.starts_with(&format!("{}/", self.path))) {
      MatchOutcome::Match
    } else {
      MatchOutcome::NoMatch
    }
  }
}

#[async_trait]
impl HttpEndpoint for AnythingEndpoint {
  async fn handle(&self, request: &EndpointRequest<'_>) -> Result<HandlerResponse, Box<dyn Error + Send + Sync>> {
    if let Some(allowed) = &self.allowed_method {
      if request.parts.method != *allowed {
        let response = Response::builder()
          .status(StatusCode::METHOD_NOT_ALLOWED)
          .body(Full::new(Bytes::from("Method not allowed\n")).map_err(|e| match e {}).boxed())?;
        return Ok(HandlerResponse::Response(response));
      }
    }
    Ok(HandlerResponse::Response(reflection_response(request, self.field_filter)?))
  }
}

/// Builds the pretty-printed reflection response, optionally restricted to a
/// subset of fields.
pub fn reflection_response(
  request: &EndpointRequest<'_>,
  field_filter: Option<&[&str]>,
) -> Result<HttpResponse, Box<dyn Error + Send + Sync>> {
  let reflection = reflect_request(request);
  let filtered = match field_filter {
    Some(fields) => {
      let mut map = serde_json::Map::new();
      if let Value::Object(full) = reflection {
        for (key, value) in full {
          if fields.contains(&key.as_str()) {
            map.insert(key, value);
          }
        }
      }
      Value::Object(map)
    }
    None => reflection,
  };

  let body = format!("{}\n", serde_json::to_string_pretty(&filtered)?);
  Ok(
    Response::builder()
      .status(StatusCode::OK)
      .header(header::CONTENT_TYPE, "application/json")
      .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())?,
  )
}

fn reflect_request(request: &EndpointRequest<'_>) -> Value {
  let content_type = request
    .parts
    .headers
    .get(header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .unwrap_or("")
    .to_string();

  json!({
    "args": args_value(request.query),
    "data": data_value(request.body, &content_type),
    "files": files_value(request.body, &content_type),
    "form": form_value(request.body, &content_type),
    "headers": headers_value(request),
    "json": serde_json::from_slice::<Value>(request.body).unwrap_or(Value::Null),
    "method": request.parts.method.as_str(),
    "origin": request.connection.origin_ip(),
    "url": url_value(request),
  })
}

/// Decodes one query or form component, treating `+` as a space.
fn decode_component(component: &str) -> String {
  let with_spaces = component.replace('+', " ");
  urlencoding::decode(&with_spaces).map(|decoded| decoded.to_string()).unwrap_or(with_spaces)
}

/// Parses a query string into a multi-valued mapping, preserving arrival
/// order within each key.
fn parse_multi_map(input: &str) -> BTreeMap<String, Vec<String>> {
  let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
  for pair in input.split('&') {
    if pair.is_empty() {
      continue;
    }
    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
    map.entry(decode_component(key)).or_default().push(decode_component(value));
  }
  map
}

/// Serializes a multi-valued mapping, collapsing single values to scalars.
fn multi_map_value(map: BTreeMap<String, Vec<String>>) -> Value {
  let mut object = serde_json::Map::new();
  for (key, mut values) in map {
    let value = if values.len() == 1 {
      Value::String(values.remove(0))
    } else {
      Value::Array(values.into_iter().map(Value::String).collect())
    };
    object.insert(key, value);
  }
  Value::Object(object)
}

fn args_value(query: Option<&str>) -> Value {
  multi_map_value(query.map(parse_multi_map).unwrap_or_default())
}

fn data_value(body: &Bytes, content_type: &str) -> Value {
  if body.is_empty() {
    return Value::String(String::new());
  }
  match std::str::from_utf8(body) {
    Ok(text) => Value::String(text.to_string()),
    Err(_) => {
      let media_type = content_type.split(';').next().unwrap_or("application/octet-stream");
      Value::String(format!(
        "data:{media_type};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(body)
      ))
    }
  }
}

fn form_value(body: &Bytes, content_type: &str) -> Value {
  if !content_type.starts_with("application/x-www-form-urlencoded") {
    return json!({});
  }
  match std::str::from_utf8(body) {
    Ok(text) => multi_map_value(parse_multi_map(text)),
    Err(_) => json!({}),
  }
}

fn files_value(body: &Bytes, content_type: &str) -> Value {
  let Some(boundary) = multipart_boundary(content_type) else {
    return json!({});
  };
  let mut object = serde_json::Map::new();
  for (name, contents) in parse_multipart(body, &boundary) {
    object.insert(name, Value::String(String::from_utf8_lossy(&contents).to_string()));
  }
  Value::Object(object)
}

fn multipart_boundary(content_type: &str) -> Option<String> {
  if !content_type.starts_with("multipart/form-data") {
    return None;
  }
  content_type.split(';').find_map(|part| {
    let part = part.trim();
    part
      .strip_prefix("boundary=")
      .map(|b| b.trim_matches('"').to_string())
      .filter(|b| !b.is_empty())
  })
}

/// A minimal multipart/form-data parser: splits on the boundary and reads
/// each part's `Content-Disposition` name and raw contents.
fn parse_multipart(body: &[u8], boundary: &str) -> Vec<(String, Vec<u8>)> {
  let delimiter = format!("--{boundary}");
  let mut parts = Vec::new();

  let text = body;
  let mut position = 0;
  let mut sections = Vec::new();
  while let Some(found) = find_subsequence(&text[position..], delimiter.as_bytes()) {
    let start = position + found + delimiter.len();
    if text[start..].starts_with(b"--") {
      break;
    }
    position = start;
    let end = find_subsequence(&text[position..], delimiter.as_bytes())
      .map(|next| position + next)
      .unwrap_or(text.len());
    sections.push(&text[position..end]);
    position = end;
  }

  for section in sections {
    let section = section.strip_prefix(b"\r\n").unwrap_or(section);
    let Some(header_end) = find_subsequence(section, b"\r\n\r\n") else {
      continue;
    };
    let headers = String::from_utf8_lossy(&section[..header_end]);
    let Some(name) = headers.lines().find_map(|line| {
      let lower = line.to_ascii_lowercase();
      if !lower.starts_with("content-disposition:") {
        return None;
      }
      line.split(';').find_map(|attribute| {
        attribute.trim().strip_prefix("name=").map(|value| value.trim_matches('"').to_string())
      })
    }) else {
      continue;
    };
    let mut contents = &section[header_end + 4..];
    if contents.ends_with(b"\r\n") {
      contents = &contents[..contents.len() - 2];
    }
    parts.push((name, contents.to_vec()));
  }
  parts
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack.windows(needle.len()).position(|window| window == needle)
}

/// Canonicalizes header names by Title-Casing each `-`-delimited component.
fn canonical_header_name(name: &str) -> String {
  name
    .split('-')
    .map(|component| {
      let mut chars = component.chars();
      match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
        None => String::new(),
      }
    })
    .collect::<Vec<_>>()
    .join("-")
}

fn headers_value(request: &EndpointRequest<'_>) -> Value {
  let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
  for (name, value) in request.parts.headers.iter() {
    map
      .entry(canonical_header_name(name.as_str()))
      .or_default()
      .push(String::from_utf8_lossy(value.as_bytes()).to_string());
  }
  let mut object = serde_json::Map::new();
  for (name, values) in map {
    object.insert(name, Value::String(values.join(", ")));
  }
  Value::Object(object)
}

fn url_value(request: &EndpointRequest<'_>) -> Value {
  let scheme = if request.connection.info.encrypted { "https" } else { "http" };
  let authority = request
    .parts
    .headers
    .get(header::HOST)
    .and_then(|v| v.to_str().ok())
    .map(String::from)
    .or_else(|| request.parts.uri.authority().map(|a| a.to_string()))
    // Host-less requests (HTTP/1.0) fall back to the accepting socket
    .unwrap_or_else(|| request.connection.info.local_addr.to_string());
  let path_and_query = request
    .parts
    .uri
    .path_and_query()
    .map(|pq| pq.to_string())
    .unwrap_or_else(|| request.parts.uri.path().to_string());
  Value::String(format!("{scheme}://{authority}{path_and_query}"))
}

/// `/user-agent`: just the client's User-Agent header.
pub struct UserAgentEndpoint;

impl PathEndpoint for UserAgentEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    if path == "/user-agent" {
      MatchOutcome::Match
    } else {
      MatchOutcome::NoMatch
    }
  }
}

#[async_trait]
impl HttpEndpoint for UserAgentEndpoint {
  async fn handle(&self, request: &EndpointRequest<'_>) -> Result<HandlerResponse, Box<dyn Error + Send + Sync>> {
    let user_agent = request
      .parts
      .headers
      .get(header::USER_AGENT)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default();
    let body = format!("{}\n", serde_json::to_string_pretty(&json!({ "user-agent": user_agent }))?);
    let response = Response::builder()
      .status(StatusCode::OK)
      .header(header::CONTENT_TYPE, "application/json")
      .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())?;
    Ok(HandlerResponse::Response(response))
  }
}
