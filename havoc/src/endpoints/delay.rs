use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;

use super::{EndpointRequest, HandlerResponse, HttpEndpoint, MatchOutcome, PathEndpoint};

/// The longest a delay endpoint will actually sleep.
pub const MAX_DELAY: Duration = Duration::from_secs(10);

/// `/delay/<seconds>`: sleeps before answering (or before the rest of the
/// chain runs, when more path follows). Fractional seconds are allowed; the
/// sleep is capped at ten seconds.
pub struct DelayEndpoint;

fn parse_delay(path: &str) -> Option<Result<Duration, String>> {
  let rest = path.strip_prefix("/delay/")?;
  let seconds = rest.split('/').next().unwrap_or("");
  match seconds.parse::<f64>() {
    Ok(value) if value.is_finite() && value >= 0.0 => {
      Some(Ok(Duration::from_secs_f64(value).min(MAX_DELAY)))
    }
    _ => Some(Err(format!("Invalid delay \"{seconds}\""))),
  }
}

fn split_remaining(path: &str) -> Option<String> {
  let rest = path.strip_prefix("/delay/")?;
  rest.find('/').map(|index| rest[index..].to_string())
}

impl PathEndpoint for DelayEndpoint {
  fn match_path(&self, path: &str, _hostname_prefix: Option<&str>) -> MatchOutcome {
    match parse_delay(path) {
      Some(Ok(_)) => MatchOutcome::Match,
      Some(Err(message)) => MatchOutcome::Error { status: 400, message },
      None => MatchOutcome::NoMatch,
    }
  }

  fn remaining_path(&self, path: &str) -> Option<String> {
    split_remaining(path)
  }
}

#[async_trait]
impl HttpEndpoint for DelayEndpoint {
  async fn handle(&self, request: &EndpointRequest<'_>) -> Result<HandlerResponse, Box<dyn Error + Send + Sync>> {
    let delay = match parse_delay(request.matched_path) {
      Some(Ok(delay)) => delay,
      _ => Err(anyhow::anyhow!("Delay endpoint invoked with an unmatched path"))?,
    };
    tokio::time::sleep(delay).await;
    Ok(HandlerResponse::Continue)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_delay_parses_and_caps() {
    assert_eq!(parse_delay("/delay/2"), Some(Ok(Duration::from_secs(2))));
    assert_eq!(parse_delay("/delay/0.25"), Some(Ok(Duration::from_millis(250))));
    // Anything past the cap is clamped, including just past it
    assert_eq!(parse_delay("/delay/10.0001"), Some(Ok(MAX_DELAY)));
    assert_eq!(parse_delay("/delay/86400"), Some(Ok(MAX_DELAY)));
  }

  #[test]
  fn test_invalid_delays_are_structured_400s() {
    assert!(matches!(
      DelayEndpoint.match_path("/delay/soon", None),
      MatchOutcome::Error { status: 400, .. }
    ));
    assert!(matches!(
      DelayEndpoint.match_path("/delay/-1", None),
      MatchOutcome::Error { status: 400, .. }
    ));
  }

  #[test]
  fn test_remaining_path_chains_to_the_next_endpoint() {
    assert_eq!(DelayEndpoint.remaining_path("/delay/3/status/404"), Some("/status/404".to_string()));
    assert_eq!(DelayEndpoint.remaining_path("/delay/3"), None);
  }

  #[test]
  fn test_unrelated_paths_do_not_match() {
    assert_eq!(DelayEndpoint.match_path("/delay", None), MatchOutcome::NoMatch);
    assert_eq!(DelayEndpoint.match_path("/status/200", None), MatchOutcome::NoMatch);
  }
}
