use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::endpoint::{Endpoint, Listener, RelayStream};
use crate::health::HealthChecker;
use crate::metrics::MetricsCollector;
use crate::pool::{AcquireError, ConnectionPool};
use crate::relay::join_streams;
use crate::supervisor::Shutdown;

mod bastion;

pub use bastion::{Bastion, SshDestination};

/// Host-side forward: accepts connections on a local endpoint and tunnels
/// each one as an SSH channel through the bastion.
///
/// A channel-open failure (after the bastion's probe/reconnect/retry
/// ladder) drops only the inbound connection; the forward keeps accepting.
pub struct SshForward {
  local: Option<Endpoint>,
  listener: Option<Listener>,
  bastion: Arc<Bastion>,
  pool: Arc<ConnectionPool>,
  health: Arc<HealthChecker>,
  metrics: Arc<MetricsCollector>,
  buffer_size: usize,
  shutdown: Shutdown,
}

impl SshForward {
  /// Bind the local endpoint eagerly; a bind failure is fatal for the
  /// forward. `None` means "tunnel only, no accept".
  pub async fn bind(
    local: Option<Endpoint>,
    bastion: Arc<Bastion>,
    pool: Arc<ConnectionPool>,
    health: Arc<HealthChecker>,
    metrics: Arc<MetricsCollector>,
    buffer_size: usize,
    shutdown: Shutdown,
  ) -> anyhow::Result<Self> {
    let listener = match &local {
      Some(endpoint) => {
        Some(endpoint.bind().await.with_context(|| format!("unable to listen on {endpoint}"))?)
      }
      None => None,
    };
    Ok(Self { local, listener, bastion, pool, health, metrics, buffer_size, shutdown })
  }

  /// Accept and tunnel until cancelled or the listener closes. Outstanding
  /// splices complete naturally after the loop exits.
  pub async fn serve(mut self) -> anyhow::Result<()> {
    let Some(mut listener) = self.listener.take() else {
      debug!("no local endpoint configured; running tunnel-only");
      self.shutdown.triggered().await;
      return Ok(());
    };
    let local = self.local.take().map(|e| e.to_string()).unwrap_or_default();
    info!(
      event = "forward_started",
      local,
      target = self.bastion.target_path(),
      "socket forward established"
    );

    loop {
      tokio::select! {
        _ = self.shutdown.triggered() => break,
        res = listener.accept() => {
          let conn = match res {
            Ok(conn) => conn,
            Err(err) => {
              if self.shutdown.is_cancelled() {
                break;
              }
              error!(error = %err, local, "error accepting on local endpoint");
              break;
            }
          };
          debug!(local, "accepted local connection");
          let bastion = Arc::clone(&self.bastion);
          let pool = Arc::clone(&self.pool);
          let health = Arc::clone(&self.health);
          let metrics = Arc::clone(&self.metrics);
          let buffer_size = self.buffer_size;
          let shutdown = self.shutdown.clone();
          tokio::spawn(async move {
            tunnel_connection(conn, bastion, pool, health, metrics, buffer_size, shutdown).await;
          });
        }
      }
    }

    info!(event = "forward_stopped", local, "socket forward stopped");
    Ok(())
  }
}

async fn tunnel_connection(
  conn: RelayStream,
  bastion: Arc<Bastion>,
  pool: Arc<ConnectionPool>,
  health: Arc<HealthChecker>,
  metrics: Arc<MetricsCollector>,
  buffer_size: usize,
  shutdown: Shutdown,
) {
  let id = Uuid::new_v4().to_string();
  match pool.acquire(&shutdown, &id, bastion.target_path()) {
    Ok(()) => {}
    Err(AcquireError::Cancelled) => return,
    Err(err @ AcquireError::Exhausted { .. }) => {
      warn!(event = "pool_exhausted", error = %err, "dropping inbound connection");
      metrics.record_connection_error();
      health.record_error(&err);
      return;
    }
  }

  let channel = match bastion.open_channel(&shutdown).await {
    Ok(channel) => channel,
    Err(err) => {
      // Log only: a failed tunnel never takes the forward down.
      error!(event = "tunnel_failed", id, error = format!("{err:#}"), "error handling forwarded connection");
      metrics.record_connection_error();
      health.record_error(&err);
      pool.release(&id);
      return;
    }
  };

  health.increment_connections();
  metrics.record_connection();
  let started = Instant::now();

  let (outbound, inbound) = join_streams(conn, channel.into_stream(), buffer_size).await;

  metrics.record_bytes_read(outbound);
  metrics.record_bytes_written(inbound);
  metrics.record_disconnection(started.elapsed());
  health.decrement_connections();
  pool.release(&id);
  debug!(event = "tunnel_closed", id, outbound, inbound, "forwarded connection closed");
}
