use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Copy bytes from `reader` to `writer` until EOF or the first error,
/// reusing a single buffer for the lifetime of the loop. Returns the number
/// of bytes forwarded. Errors are traced, not propagated: a broken tunnel
/// direction only ever ends its own copy loop.
pub async fn copy_stream<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize) -> u64
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = vec![0u8; buffer_size];
  let mut total = 0u64;
  loop {
    match reader.read(&mut buffer).await {
      Ok(0) => {
        trace!(event = "splice_eof", forwarded = total, "read side reached EOF");
        break;
      }
      Ok(n) => {
        if let Err(err) = writer.write_all(&buffer[..n]).await {
          trace!(event = "splice_write_error", error = %err, "error writing to peer");
          break;
        }
        total += n as u64;
        trace!(event = "splice_forwarded", bytes = n, "forwarded bytes");
      }
      Err(err) => {
        trace!(event = "splice_read_error", error = %err, "error reading from peer");
        break;
      }
    }
  }
  total
}

/// Splice two duplex streams into a tunnel.
///
/// Each direction runs in its own task; when a direction finishes (EOF or
/// error) the peer's write side is shut down so it observes EOF instead of
/// an abortive reset. The pair is released exactly once, after both tasks
/// complete. Returns bytes forwarded as `(a_to_b, b_to_a)`.
pub async fn join_streams<A, B>(a: A, b: B, buffer_size: usize) -> (u64, u64)
where
  A: AsyncRead + AsyncWrite + Send + 'static,
  B: AsyncRead + AsyncWrite + Send + 'static,
{
  let (mut read_a, mut write_a) = tokio::io::split(a);
  let (mut read_b, mut write_b) = tokio::io::split(b);

  let a_to_b = tokio::spawn(async move {
    let forwarded = copy_stream(&mut read_a, &mut write_b, buffer_size).await;
    let _ = write_b.shutdown().await;
    forwarded
  });
  let b_to_a = tokio::spawn(async move {
    let forwarded = copy_stream(&mut read_b, &mut write_a, buffer_size).await;
    let _ = write_a.shutdown().await;
    forwarded
  });

  let (forward, backward) = tokio::join!(a_to_b, b_to_a);
  (forward.unwrap_or(0), backward.unwrap_or(0))
}

/// Splice two duplex streams with the force-close rule: the first EOF or
/// error in either direction ends the whole splice, and dropping the four
/// halves closes both streams outright so the other direction's blocked
/// read is unstuck. No write half is shut down and nothing is drained.
///
/// Returns bytes forwarded as `(a_to_b, b_to_a)`; only the direction that
/// ran to completion carries its count, the cancelled one reports zero.
pub async fn race_streams<A, B>(a: A, b: B, buffer_size: usize) -> (u64, u64)
where
  A: AsyncRead + AsyncWrite,
  B: AsyncRead + AsyncWrite,
{
  let (mut read_a, mut write_a) = tokio::io::split(a);
  let (mut read_b, mut write_b) = tokio::io::split(b);

  let mut a_to_b = 0u64;
  let mut b_to_a = 0u64;
  tokio::select! {
    n = copy_stream(&mut read_a, &mut write_b, buffer_size) => a_to_b = n,
    n = copy_stream(&mut read_b, &mut write_a, buffer_size) => b_to_a = n,
  }
  (a_to_b, b_to_a)
}
