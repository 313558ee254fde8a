use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Stream wrapper that arms a fresh idle deadline before every read and
/// write. A stalled peer turns the pending operation into
/// `io::ErrorKind::TimedOut` within the configured window, so a splice task
/// blocked on a half-closed connection always gets unstuck.
pub struct DeadlineStream<S> {
  inner: S,
  read_timeout: Duration,
  write_timeout: Duration,
  read_deadline: Option<Pin<Box<Sleep>>>,
  write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> DeadlineStream<S> {
  pub fn new(inner: S, read_timeout: Duration, write_timeout: Duration) -> Self {
    Self { inner, read_timeout, write_timeout, read_deadline: None, write_deadline: None }
  }

  pub fn into_inner(self) -> S {
    self.inner
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    let this = self.get_mut();

    let timeout = this.read_timeout;
    let deadline = this.read_deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    if deadline.as_mut().poll(cx).is_ready() {
      this.read_deadline = None;
      return Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline elapsed")));
    }

    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(result) => {
        this.read_deadline = None;
        Poll::Ready(result)
      }
      Poll::Pending => Poll::Pending,
    }
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    let this = self.get_mut();

    let timeout = this.write_timeout;
    let deadline = this.write_deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    if deadline.as_mut().poll(cx).is_ready() {
      this.write_deadline = None;
      return Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline elapsed")));
    }

    match Pin::new(&mut this.inner).poll_write(cx, buf) {
      Poll::Ready(result) => {
        this.write_deadline = None;
        Poll::Ready(result)
      }
      Poll::Pending => Poll::Pending,
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::*;

  #[tokio::test(start_paused = true)]
  async fn read_on_a_silent_peer_times_out() {
    let (local, _remote) = tokio::io::duplex(64);
    let mut stream = DeadlineStream::new(local, Duration::from_secs(30), Duration::from_secs(30));

    let mut buf = [0u8; 16];
    let err = stream.read(&mut buf).await.expect_err("read should time out");
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
  }

  #[tokio::test(start_paused = true)]
  async fn each_read_gets_a_fresh_deadline() {
    let (local, mut remote) = tokio::io::duplex(64);
    let mut stream = DeadlineStream::new(local, Duration::from_secs(30), Duration::from_secs(30));

    let writer = tokio::spawn(async move {
      for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        remote.write_all(b"x").await.unwrap();
      }
      remote
    });

    // Three reads, each arriving after 20s: none hit the 30s deadline even
    // though the total elapsed time is well past it.
    let mut buf = [0u8; 1];
    for _ in 0..3 {
      stream.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"x");
    }

    let mut remote = writer.await.unwrap();
    // Once the peer goes quiet the next read still times out.
    let err = stream.read(&mut buf).await.expect_err("read should time out");
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    let _ = remote.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn write_against_a_full_peer_times_out() {
    // Buffer of 1 byte and nobody reading: the second write blocks.
    let (local, _remote) = tokio::io::duplex(1);
    let mut stream = DeadlineStream::new(local, Duration::from_secs(30), Duration::from_secs(30));

    stream.write_all(b"a").await.unwrap();
    let err = stream.write_all(b"b").await.expect_err("write should time out");
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
  }

  #[tokio::test]
  async fn completed_operations_pass_data_through() {
    let (local, mut remote) = tokio::io::duplex(64);
    let mut stream = DeadlineStream::new(local, Duration::from_secs(30), Duration::from_secs(30));

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    remote.write_all(b"pong").await.unwrap();
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
  }
}
