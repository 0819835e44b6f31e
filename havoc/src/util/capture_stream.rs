use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// The shared per-connection list of received byte chunks.
///
/// Appended by [`CaptureStream`] as bytes arrive, drained by the raw-echo
/// endpoint, and cleared by the HTTP router at each request boundary so
/// keep-alive sockets do not accumulate unbounded history.
pub type ReceivedData = Arc<Mutex<Vec<Bytes>>>;

pub fn received_data_bytes(received_data: &ReceivedData) -> Vec<u8> {
  let chunks = received_data.lock().expect("received data lock poisoned");
  let mut out = Vec::with_capacity(chunks.iter().map(|c| c.len()).sum());
  for chunk in chunks.iter() {
    out.extend_from_slice(chunk);
  }
  out
}

pub fn clear_received_data(received_data: &ReceivedData) {
  received_data.lock().expect("received data lock poisoned").clear();
}

pin_project! {
  /// Copies every chunk read from the inner stream into a shared buffer.
  ///
  /// Installed below the HTTP/1 parser, which consumes request bytes without
  /// exposing them; the raw-echo endpoint reads the copies instead.
  pub struct CaptureStream<S> {
    received_data: ReceivedData,
    #[pin]
    inner: S,
  }
}

impl<S> CaptureStream<S> {
  pub fn new(inner: S, received_data: ReceivedData) -> Self {
    Self { received_data, inner }
  }
}

impl<S: AsyncRead> AsyncRead for CaptureStream<S> {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
    let this = self.project();
    let filled_before = buf.filled().len();
    let result = this.inner.poll_read(cx, buf);
    if let Poll::Ready(Ok(())) = &result {
      let new_bytes = &buf.filled()[filled_before..];
      if !new_bytes.is_empty() {
        this
          .received_data
          .lock()
          .expect("received data lock poisoned")
          .push(Bytes::copy_from_slice(new_bytes));
      }
    }
    result
  }
}

impl<S: AsyncWrite> AsyncWrite for CaptureStream<S> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
    self.project().inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  #[tokio::test]
  async fn test_reads_are_captured_in_order() {
    let inner = tokio_test::io::Builder::new().read(b"GET / HT").read(b"TP/1.1\r\n").build();
    let received_data: ReceivedData = Default::default();
    let mut stream = CaptureStream::new(inner, received_data.clone());

    let mut sink = Vec::new();
    stream.read_to_end(&mut sink).await.unwrap();

    assert_eq!(sink, b"GET / HTTP/1.1\r\n");
    assert_eq!(received_data_bytes(&received_data), b"GET / HTTP/1.1\r\n");
    assert_eq!(received_data.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_clear_resets_the_buffer() {
    let inner = tokio_test::io::Builder::new().read(b"abc").build();
    let received_data: ReceivedData = Default::default();
    let mut stream = CaptureStream::new(inner, received_data.clone());

    let mut sink = Vec::new();
    stream.read_to_end(&mut sink).await.unwrap();
    clear_received_data(&received_data);

    assert!(received_data_bytes(&received_data).is_empty());
  }
}
