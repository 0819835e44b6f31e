use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::{ForcedSubprotocol, MatchOutcome, PathEndpoint, WsEndpoint, WsStream};

/// `/ws/echo`: echoes text and binary frames until the client closes.
pub struct WsEchoEndpoint;

impl PathEndpoint for WsEchoEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    if path == "/ws/echo" {
      MatchOutcome::Match
    } else {
      MatchOutcome::NoMatch
    }
  }
}

#[async_trait]
impl WsEndpoint for WsEchoEndpoint {
  async fn handle(&self, socket: &mut WsStream, _matched_path: &str) -> Result<bool, Box<dyn Error + Send + Sync>> {
    while let Some(message) = socket.next().await {
      match message? {
        Message::Text(text) => socket.send(Message::Text(text)).await?,
        Message::Binary(data) => socket.send(Message::Binary(data)).await?,
        Message::Ping(data) => socket.send(Message::Pong(data)).await?,
        Message::Close(_) => return Ok(false),
        _ => {}
      }
    }
    Ok(false)
  }
}

/// `/ws/subprotocol/<proto>/...`: forces the upgrade to select the given
/// subprotocol, then hands the remaining path to the next endpoint.
pub struct WsSubprotocolEndpoint;

fn subprotocol_parts(path: &str) -> Option<(&str, Option<&str>)> {
  let rest = path.strip_prefix("/ws/subprotocol/")?;
  match rest.find('/') {
    Some(index) if index > 0 => Some((&rest[..index], Some(&rest[index..]))),
    None if !rest.is_empty() => Some((rest, None)),
    _ => None,
  }
}

impl PathEndpoint for WsSubprotocolEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    if subprotocol_parts(path).is_some() {
      MatchOutcome::Match
    } else {
      MatchOutcome::NoMatch
    }
  }

  fn remaining_path(&self, path: &str) -> Option<String> {
    // The remainder re-enters the WebSocket namespace
    subprotocol_parts(path).and_then(|(_, remaining)| remaining.map(|rest| format!("/ws{rest}")))
  }
}

#[async_trait]
impl WsEndpoint for WsSubprotocolEndpoint {
  fn protocol(&self, path: &str) -> Option<ForcedSubprotocol> {
    subprotocol_parts(path).map(|(protocol, _)| ForcedSubprotocol::Value(protocol.to_string()))
  }

  async fn handle(&self, _socket: &mut WsStream, _matched_path: &str) -> Result<bool, Box<dyn Error + Send + Sync>> {
    // The work happened during the upgrade; the chain continues
    Ok(true)
  }
}

/// `/ws/no-subprotocol`: completes the upgrade without any
/// `Sec-WebSocket-Protocol` header, even when the client offered protocols.
pub struct WsNoSubprotocolEndpoint;

impl PathEndpoint for WsNoSubprotocolEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    if path == "/ws/no-subprotocol" {
      MatchOutcome::Match
    } else {
      MatchOutcome::NoMatch
    }
  }
}

#[async_trait]
impl WsEndpoint for WsNoSubprotocolEndpoint {
  fn protocol(&self, _path: &str) -> Option<ForcedSubprotocol> {
    Some(ForcedSubprotocol::Omit)
  }

  async fn handle(&self, socket: &mut WsStream, _matched_path: &str) -> Result<bool, Box<dyn Error + Send + Sync>> {
    // Wait for the client to finish with the socket
    while let Some(message) = socket.next().await {
      if let Message::Close(_) = message? {
        return Ok(false);
      }
    }
    Ok(false)
  }
}

/// `/ws/delay/<seconds>/...`: sleeps after the upgrade, then chains.
pub struct WsDelayEndpoint;

fn parse_ws_delay(path: &str) -> Option<Result<Duration, String>> {
  let rest = path.strip_prefix("/ws/delay/")?;
  let seconds = rest.split('/').next().unwrap_or("");
  match seconds.parse::<f64>() {
    Ok(value) if value.is_finite() && value >= 0.0 => {
      Some(Ok(Duration::from_secs_f64(value).min(super::delay::MAX_DELAY)))
    }
    _ => Some(Err(format!("Invalid delay \"{seconds}\""))),
  }
}

impl PathEndpoint for WsDelayEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    match parse_ws_delay(path) {
      Some(Ok(_)) => MatchOutcome::Match,
      Some(Err(message)) => MatchOutcome::Error { status: 400, message },
      None => MatchOutcome::NoMatch,
    }
  }

  fn remaining_path(&self, path: &str) -> Option<String> {
    let rest = path.strip_prefix("/ws/delay/")?;
    rest.find('/').map(|index| format!("/ws{}", &rest[index..]))
  }
}

#[async_trait]
impl WsEndpoint for WsDelayEndpoint {
  async fn handle(&self, _socket: &mut WsStream, matched_path: &str) -> Result<bool, Box<dyn Error + Send + Sync>> {
    if let Some(Ok(delay)) = parse_ws_delay(matched_path) {
      tokio::time::sleep(delay).await;
    }
    Ok(true)
  }
}

/// `/ws/close/<code>`: closes immediately with the given close code.
pub struct WsCloseEndpoint;

fn parse_close_code(path: &str) -> Option<Result<u16, String>> {
  let code = path.strip_prefix("/ws/close/")?;
  match code.parse::<u16>() {
    Ok(value) if (1000..=4999).contains(&value) => Some(Ok(value)),
    _ => Some(Err(format!("Invalid close code \"{code}\""))),
  }
}

impl PathEndpoint for WsCloseEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    match parse_close_code(path) {
      Some(Ok(_)) => MatchOutcome::Match,
      Some(Err(message)) => MatchOutcome::Error { status: 400, message },
      None => MatchOutcome::NoMatch,
    }
  }
}

#[async_trait]
impl WsEndpoint for WsCloseEndpoint {
  async fn handle(&self, socket: &mut WsStream, matched_path: &str) -> Result<bool, Box<dyn Error + Send + Sync>> {
    let code = match parse_close_code(matched_path) {
      Some(Ok(code)) => code,
      _ => Err(anyhow::anyhow!("Close endpoint invoked with an unmatched path"))?,
    };
    socket
      .close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
      }))
      .await?;
    Ok(false)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_subprotocol_extraction_and_chaining() {
    assert_eq!(subprotocol_parts("/ws/subprotocol/mqtt/echo"), Some(("mqtt", Some("/echo"))));
    assert_eq!(subprotocol_parts("/ws/subprotocol/mqtt"), Some(("mqtt", None)));
    assert_eq!(subprotocol_parts("/ws/subprotocol/"), None);
    assert_eq!(
      WsSubprotocolEndpoint.remaining_path("/ws/subprotocol/mqtt/echo"),
      Some("/ws/echo".to_string())
    );
    assert_eq!(WsSubprotocolEndpoint.remaining_path("/ws/subprotocol/mqtt"), None);
    assert_eq!(
      WsSubprotocolEndpoint.protocol("/ws/subprotocol/mqtt/echo"),
      Some(ForcedSubprotocol::Value("mqtt".to_string()))
    );
  }

  #[test]
  fn test_ws_delay_rewrites_remaining_path_under_ws() {
    assert_eq!(WsDelayEndpoint.remaining_path("/ws/delay/1/echo"), Some("/ws/echo".to_string()));
    assert_eq!(WsDelayEndpoint.remaining_path("/ws/delay/1"), None);
  }

  #[test]
  fn test_close_code_bounds() {
    assert_eq!(WsCloseEndpoint.match_path("/ws/close/1000", None), MatchOutcome::Match);
    assert_eq!(WsCloseEndpoint.match_path("/ws/close/4999", None), MatchOutcome::Match);
    assert!(matches!(
      WsCloseEndpoint.match_path("/ws/close/999", None),
      MatchOutcome::Error { status: 400, .. }
    ));
    assert!(matches!(
      WsCloseEndpoint.match_path("/ws/close/soon", None),
      MatchOutcome::Error { status: 400, .. }
    ));
  }

  #[test]
  fn test_no_subprotocol_forces_omission() {
    assert_eq!(WsNoSubprotocolEndpoint.protocol("/ws/no-subprotocol"), Some(ForcedSubprotocol::Omit));
    assert_eq!(WsEchoEndpoint.protocol("/ws/echo"), None);
  }
}
