use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, RelayStream};
use crate::relay::deadline::DeadlineStream;
use crate::relay::splice::race_streams;
use crate::supervisor::Shutdown;

/// Generic duplex relay: accept connections on `target`, dial `source` for
/// each one, and splice both directions.
///
/// A periodic liveness probe dials `source` and closes immediately; when the
/// probe fails the whole relay cancels itself (cleanly). Either EOF or an
/// error on one side of a connection forces both sides closed.
pub struct DuplexRelay {
  source: Endpoint,
  target: Endpoint,
  buffer_size: usize,
  health_interval: Duration,
  read_timeout: Duration,
  write_timeout: Duration,
  shutdown: Shutdown,
}

impl DuplexRelay {
  pub fn new(
    source: Endpoint,
    target: Endpoint,
    buffer_size: usize,
    health_interval: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    shutdown: Shutdown,
  ) -> Self {
    Self { source, target, buffer_size, health_interval, read_timeout, write_timeout, shutdown }
  }

  /// Run until cancelled or until the source stops answering the liveness
  /// probe. Only a listener bind failure is an error.
  pub async fn run(self) -> anyhow::Result<()> {
    let mut listener = self
      .target
      .bind()
      .await
      .with_context(|| format!("unable to listen on {}", self.target))?;
    info!(event = "relay_started", source = %self.source, target = %self.target, "duplex relay started");

    // Local cancellation scope: the probe cancels this relay without
    // touching the rest of the process.
    let relay_shutdown = self.shutdown.child();
    tokio::spawn(probe_source(self.source.clone(), self.health_interval, relay_shutdown.clone()));

    loop {
      tokio::select! {
        _ = relay_shutdown.triggered() => break,
        res = listener.accept() => {
          let conn = match res {
            Ok(conn) => conn,
            Err(err) => {
              if relay_shutdown.is_cancelled() {
                break;
              }
              debug!(error = %err, "relay accept error");
              continue;
            }
          };
          let source = self.source.clone();
          let buffer_size = self.buffer_size;
          let read_timeout = self.read_timeout;
          let write_timeout = self.write_timeout;
          tokio::spawn(async move {
            handle_connection(conn, source, buffer_size, read_timeout, write_timeout).await;
          });
        }
      }
    }

    info!(event = "relay_stopped", source = %self.source, target = %self.target, "duplex relay stopped");
    Ok(())
  }
}

/// Dial the source on every tick; the first failure cancels the relay. The
/// first probe fires immediately so a relay against a dead source never
/// accepts a connection it cannot serve.
async fn probe_source(source: Endpoint, interval: Duration, shutdown: Shutdown) {
  let mut ticker = tokio::time::interval(interval);
  loop {
    tokio::select! {
      _ = shutdown.triggered() => return,
      _ = ticker.tick() => {
        match source.dial().await {
          Ok(conn) => drop(conn),
          Err(err) => {
            warn!(event = "relay_source_unreachable", source = %source, error = %err, "source failed liveness probe");
            shutdown.cancel();
            return;
          }
        }
      }
    }
  }
}

async fn handle_connection(
  conn: RelayStream,
  source: Endpoint,
  buffer_size: usize,
  read_timeout: Duration,
  write_timeout: Duration,
) {
  let conn = DeadlineStream::new(conn, read_timeout, write_timeout);

  let source_conn = match source.dial().await {
    Ok(stream) => stream,
    Err(err) => {
      debug!(source = %source, error = %err, "unable to dial relay source");
      return;
    }
  };

  race_streams(source_conn, conn, buffer_size).await;
}
