use std::error::Error;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{header, Request, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use crate::classifier::ConnectionContext;
use crate::endpoints::{resolve_endpoint_chain, ForcedSubprotocol, HttpResponse};
use crate::request_handler::plain_response;
use crate::server::ServerState;

/// Handles a WebSocket upgrade request: resolves the endpoint chain, applies
/// subprotocol forcing, completes the handshake, and runs the chained
/// handlers in order on the upgraded socket.
pub async fn handle_upgrade(
  request: &mut Request<Incoming>,
  _context: &Arc<ConnectionContext>,
  state: &Arc<ServerState>,
  path: &str,
  hostname_prefix: Option<&str>,
) -> Result<HttpResponse, Box<dyn Error + Send + Sync>> {
  let chain = match resolve_endpoint_chain(&state.ws_endpoints, path, hostname_prefix) {
    Ok(chain) => chain,
    Err(error) => {
      let status = StatusCode::from_u16(error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
      return Ok(plain_response(status, &format!("{}\n", error.message)));
    }
  };

  // At most one endpoint in the chain may force the subprotocol
  let forced: Vec<ForcedSubprotocol> = chain
    .iter()
    .filter_map(|(endpoint, matched_path)| endpoint.protocol(matched_path))
    .collect();
  if forced.len() > 1 {
    return Ok(plain_response(
      StatusCode::BAD_REQUEST,
      "Multiple subprotocol endpoints in one chain\n",
    ));
  }

  let client_protocols = request
    .headers()
    .get(header::SEC_WEBSOCKET_PROTOCOL)
    .and_then(|value| value.to_str().ok())
    .map(|value| value.split(',').map(|p| p.trim().to_string()).collect::<Vec<_>>())
    .unwrap_or_default();

  let (mut response, websocket) = hyper_tungstenite::upgrade(request, None)?;

  match forced.into_iter().next() {
    Some(ForcedSubprotocol::Value(protocol)) => {
      response
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, header::HeaderValue::from_str(&protocol)?);
    }
    Some(ForcedSubprotocol::Omit) => {
      response.headers_mut().remove(header::SEC_WEBSOCKET_PROTOCOL);
    }
    None => {
      // Default negotiation: select the first protocol the client offered
      if let Some(first) = client_protocols.first() {
        if let Ok(value) = header::HeaderValue::from_str(first) {
          response.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
      }
    }
  }

  // The chain is re-resolved inside the task; resolution is deterministic
  // and the session must not borrow from this request's stack
  let state = state.clone();
  let path = path.to_string();
  let hostname_prefix = hostname_prefix.map(String::from);
  tokio::spawn(async move {
    let mut socket = match websocket.await {
      Ok(socket) => socket,
      Err(error) => {
        state.error_logger.log(&format!("WebSocket handshake failed: {error}")).await;
        return;
      }
    };

    let chain = match resolve_endpoint_chain(&state.ws_endpoints, &path, hostname_prefix.as_deref()) {
      Ok(chain) => chain,
      Err(_) => return,
    };

    for (endpoint, matched_path) in chain {
      match endpoint.handle(&mut socket, &matched_path).await {
        Ok(true) => continue,
        Ok(false) => break,
        Err(error) => {
          state.error_logger.log(&format!("WebSocket handler failed: {error}")).await;
          use futures_util::SinkExt;
          socket
            .close(Some(CloseFrame {
              code: CloseCode::Error,
              reason: "Internal error".into(),
            }))
            .await
            .unwrap_or_default();
          break;
        }
      }
    }
  });

  Ok(response.map(|body| {
    use http_body_util::BodyExt;
    body.map_err(|e| match e {}).boxed()
  }))
}
