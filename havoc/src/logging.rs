use async_channel::{Receiver, Sender};
use chrono::prelude::*;
use tokio::io::AsyncWriteExt;

/// Represents a log message with its content and error status.
pub struct LogMessage {
  is_error: bool,
  message: String,
}

impl LogMessage {
  /// Creates a new `LogMessage` instance.
  pub fn new(message: String, is_error: bool) -> Self {
    LogMessage { is_error, message }
  }

  /// Consumes the `LogMessage` and returns its components.
  pub fn get_message(self) -> (String, bool) {
    (self.message, self.is_error)
  }
}

/// Facilitates logging of error messages through a provided logger sender.
pub struct ErrorLogger {
  logger: Option<Sender<LogMessage>>,
}

impl ErrorLogger {
  /// Creates a new `ErrorLogger` instance.
  pub fn new(logger: Sender<LogMessage>) -> Self {
    Self { logger: Some(logger) }
  }

  /// Creates a new `ErrorLogger` instance without any underlying logger.
  #[allow(dead_code)]
  pub fn without_logger() -> Self {
    Self { logger: None }
  }

  /// Logs an error message asynchronously.
  pub async fn log(&self, message: &str) {
    if let Some(logger) = &self.logger {
      logger
        .send(LogMessage::new(String::from(message), true))
        .await
        .unwrap_or_default();
    }
  }
}

impl Clone for ErrorLogger {
  fn clone(&self) -> Self {
    Self {
      logger: self.logger.clone(),
    }
  }
}

/// Runs the logging event loop, draining the log channel into stdout and
/// stderr. Error lines are timestamped.
pub async fn logging_event_loop(receive_log: Receiver<LogMessage>) {
  let mut stdout = tokio::io::stdout();
  let mut stderr = tokio::io::stderr();

  while let Ok(message) = receive_log.recv().await {
    let (mut message, is_error) = message.get_message();
    if is_error {
      let now: DateTime<Local> = Local::now();
      let formatted_time = now.format("%Y-%m-%d %H:%M:%S").to_string();
      message = format!("[{formatted_time}]: {message}");
    }
    message.push('\n');
    if is_error {
      stderr.write_all(message.as_bytes()).await.unwrap_or_default();
    } else {
      stdout.write_all(message.as_bytes()).await.unwrap_or_default();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_error_logger_sends_error_messages() {
    let (tx, rx) = async_channel::bounded(16);
    let logger = ErrorLogger::new(tx);
    logger.log("something failed").await;

    let (message, is_error) = rx.recv().await.unwrap().get_message();
    assert_eq!(message, "something failed");
    assert!(is_error);
  }

  #[tokio::test]
  async fn test_error_logger_without_logger_is_a_noop() {
    let logger = ErrorLogger::without_logger();
    logger.log("dropped").await;
  }
}
