use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A byte stream that can be boxed and handed between protocol layers.
pub trait RwStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RwStream for T {}

/// An owned, boxed duplex stream.
pub type BoxedRwStream = Box<dyn RwStream>;

pin_project! {
  /// Replays a previously peeked prefix before reading from the inner stream.
  ///
  /// The connection classifier reads ahead to decide which protocol handler a
  /// stream belongs to; the consumed bytes are pushed back through this
  /// wrapper so the downstream parser observes the stream from offset zero.
  pub struct RewindStream<S> {
    prefix: Bytes,
    #[pin]
    inner: S,
  }
}

impl<S> RewindStream<S> {
  pub fn new(prefix: Bytes, inner: S) -> Self {
    Self { prefix, inner }
  }
}

impl<S: AsyncRead> AsyncRead for RewindStream<S> {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
    let this = self.project();
    if !this.prefix.is_empty() {
      let to_copy = this.prefix.len().min(buf.remaining());
      buf.put_slice(&this.prefix.split_to(to_copy));
      return Poll::Ready(Ok(()));
    }
    this.inner.poll_read(cx, buf)
  }
}

impl<S: AsyncWrite> AsyncWrite for RewindStream<S> {
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
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn test_prefix_is_replayed_before_inner() {
    let inner = tokio_test::io::Builder::new().read(b" world").build();
    let mut stream = RewindStream::new(Bytes::from_static(b"hello"), inner);

    let mut output = Vec::new();
    stream.read_to_end(&mut output).await.unwrap();
    assert_eq!(output, b"hello world");
  }

  #[tokio::test]
  async fn test_small_read_buffer_drains_prefix_gradually() {
    let inner = tokio_test::io::Builder::new().build();
    let mut stream = RewindStream::new(Bytes::from_static(b"abcd"), inner);

    let mut buf = [0u8; 3];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"abc");
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"d");
  }

  #[tokio::test]
  async fn test_writes_pass_through() {
    let inner = tokio_test::io::Builder::new().write(b"ping").build();
    let mut stream = RewindStream::new(Bytes::new(), inner);

    stream.write_all(b"ping").await.unwrap();
  }
}
