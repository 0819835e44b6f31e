pub mod anything;
pub mod delay;
pub mod echo;
pub mod fingerprint;
pub mod ip;
pub mod status;
pub mod ws;

use std::error::Error;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::upgrade::Upgraded;
use hyper::Response;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::WebSocketStream;

use crate::classifier::ConnectionContext;

/// The HTTP response type endpoints produce.
pub type HttpResponse = Response<BoxBody<Bytes, std::io::Error>>;

/// The WebSocket stream handed to WebSocket endpoint handlers.
pub type WsStream = WebSocketStream<TokioIo<Upgraded>>;

/// The outcome of matching a path against one endpoint.
///
/// Endpoints with path parameters report malformed parameters as a structured
/// error instead of a non-match, so the router can answer 400 rather than 404.
#[derive(Debug, PartialEq, Eq)]
pub enum MatchOutcome {
  Match,
  NoMatch,
  Error { status: u16, message: String },
}

/// A structured routing error carrying the HTTP status to answer with.
#[derive(Debug, PartialEq, Eq)]
pub struct EndpointError {
  pub status: u16,
  pub message: String,
}

impl std::fmt::Debug for dyn PathEndpoint + '_ {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "<dyn PathEndpoint>")
  }
}

/// Path matching shared by HTTP and WebSocket endpoints.
pub trait PathEndpoint {
  fn match_path(&self, path: &str, hostname_prefix: Option<&str>) -> MatchOutcome;

  /// The part of the path left for the next endpoint in the chain, if this
  /// endpoint only consumes a prefix.
  fn remaining_path(&self, _path: &str) -> Option<String> {
    None
  }
}

/// Everything an HTTP endpoint handler can see about the request.
pub struct EndpointRequest<'a> {
  pub parts: &'a hyper::http::request::Parts,
  pub body: &'a Bytes,
  pub matched_path: &'a str,
  pub query: Option<&'a str>,
  pub connection: &'a ConnectionContext,
}

/// What an HTTP handler decided to do with the request.
pub enum HandlerResponse {
  Response(HttpResponse),
  /// Defer to the next endpoint in the chain (or the default 200).
  Continue,
}

#[async_trait]
pub trait HttpEndpoint: PathEndpoint + Send + Sync {
  async fn handle(&self, request: &EndpointRequest<'_>) -> Result<HandlerResponse, Box<dyn Error + Send + Sync>>;

  /// Whether this handler consumes HTTP/2 frame telemetry; when nothing in a
  /// chain does, the router stops frame capture to bound memory.
  fn uses_frame_tap(&self) -> bool {
    false
  }
}

/// The subprotocol decision a WebSocket endpoint forces during the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForcedSubprotocol {
  Value(String),
  /// Complete the upgrade without any subprotocol header at all.
  Omit,
}

#[async_trait]
pub trait WsEndpoint: PathEndpoint + Send + Sync {
  /// The subprotocol this endpoint forces, making it a "protocol endpoint".
  fn protocol(&self, _path: &str) -> Option<ForcedSubprotocol> {
    None
  }

  /// Handles the socket after the upgrade. Returns `false` when the socket
  /// was closed and the rest of the chain should not run.
  async fn handle(&self, socket: &mut WsStream, matched_path: &str) -> Result<bool, Box<dyn Error + Send + Sync>>;
}

/// Resolves a path against an ordered endpoint list into a chain of
/// `(endpoint, matched path)` entries.
///
/// Each matched endpoint may consume a prefix and hand the remainder to the
/// next match. The chain is bounded at ten entries; running past the bound
/// answers 400, and a path no endpoint matches answers 404.
pub fn resolve_endpoint_chain<'a, E>(
  endpoints: &'a [Box<E>],
  path: &str,
  hostname_prefix: Option<&str>,
) -> Result<Vec<(&'a E, String)>, EndpointError>
where
  E: PathEndpoint + ?Sized,
{
  let mut entries: Vec<(&'a E, String)> = Vec::new();
  let mut current = path.to_string();

  while !current.is_empty() {
    if entries.len() >= 10 {
      return Err(EndpointError {
        status: 400,
        message: "Endpoint chain exceeded maximum depth".to_string(),
      });
    }

    let mut matched = None;
    for endpoint in endpoints {
      match endpoint.match_path(&current, hostname_prefix) {
        MatchOutcome::Match => {
          matched = Some(endpoint.as_ref());
          break;
        }
        MatchOutcome::NoMatch => continue,
        MatchOutcome::Error { status, message } => return Err(EndpointError { status, message }),
      }
    }

    let endpoint = matched.ok_or_else(|| EndpointError {
      status: 404,
      message: match hostname_prefix {
        Some(prefix) => format!("No endpoint matched \"{path}\" for hostname prefix \"{prefix}\""),
        None => format!("No endpoint matched \"{path}\""),
      },
    })?;

    entries.push((endpoint, current.clone()));
    current = endpoint.remaining_path(&current).unwrap_or_default();
  }

  Ok(entries)
}

#[cfg(test)]
mod tests {
  use super::*;

  /// A test endpoint consuming `/hop` prefixes so chains can be driven to
  /// arbitrary depth.
  struct HopEndpoint;

  impl PathEndpoint for HopEndpoint {
    fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
      if path == "/hop" || path.starts_with("/hop/") {
        MatchOutcome::Match
      } else {
        MatchOutcome::NoMatch
      }
    }

    fn remaining_path(&self, path: &str) -> Option<String> {
      path.strip_prefix("/hop").filter(|rest| !rest.is_empty()).map(String::from)
    }
  }

  struct TerminalEndpoint;

  impl PathEndpoint for TerminalEndpoint {
    fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
      if path == "/end" {
        MatchOutcome::Match
      } else {
        MatchOutcome::NoMatch
      }
    }
  }

  struct PickyEndpoint;

  impl PathEndpoint for PickyEndpoint {
    fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
      if path.starts_with("/picky/") {
        MatchOutcome::Error {
          status: 400,
          message: "Invalid parameter".to_string(),
        }
      } else {
        MatchOutcome::NoMatch
      }
    }
  }

  fn endpoints() -> Vec<Box<dyn PathEndpoint>> {
    vec![Box::new(HopEndpoint), Box::new(TerminalEndpoint), Box::new(PickyEndpoint)]
  }

  fn hops(count: usize) -> String {
    let mut path = String::new();
    for _ in 0..count {
      path.push_str("/hop");
    }
    path
  }

  #[test]
  fn test_single_match_covers_the_path() {
    let catalog = endpoints();
    let chain = resolve_endpoint_chain(&catalog, "/end", None).unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].1, "/end");
  }

  #[test]
  fn test_chain_rematches_remaining_path() {
    let catalog = endpoints();
    let chain = resolve_endpoint_chain(&catalog, "/hop/hop/end", None).unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[0].1, "/hop/hop/end");
    assert_eq!(chain[1].1, "/hop/end");
    assert_eq!(chain[2].1, "/end");
  }

  #[test]
  fn test_depth_ten_accepted_eleven_rejected() {
    let catalog = endpoints();
    assert_eq!(resolve_endpoint_chain(&catalog, &hops(10), None).unwrap().len(), 10);

    let error = resolve_endpoint_chain(&catalog, &hops(11), None).unwrap_err();
    assert_eq!(error.status, 400);
    assert!(error.message.contains("maximum depth"));
  }

  #[test]
  fn test_unmatched_path_is_404_naming_path_and_prefix() {
    let catalog = endpoints();
    let error = resolve_endpoint_chain(&catalog, "/nowhere", Some("expired")).unwrap_err();
    assert_eq!(error.status, 404);
    assert!(error.message.contains("/nowhere"));
    assert!(error.message.contains("expired"));
  }

  #[test]
  fn test_match_errors_propagate_with_status() {
    let catalog = endpoints();
    let error = resolve_endpoint_chain(&catalog, "/picky/x", None).unwrap_err();
    assert_eq!(error.status, 400);
    assert_eq!(error.message, "Invalid parameter");
  }

  #[test]
  fn test_error_beats_404_mid_chain() {
    let catalog = endpoints();
    let error = resolve_endpoint_chain(&catalog, "/hop/picky/x", None).unwrap_err();
    assert_eq!(error.status, 400);
  }
}
