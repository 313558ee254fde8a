use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use russh::Channel;
use russh::keys::{HashAlg, PublicKey};
use russh::server::{Auth, Msg, Session};
use tokio::net::{TcpListener, UnixStream};
use tracing::{debug, info, warn};

use crate::health::HealthChecker;
use crate::keys::Identity;
use crate::metrics::MetricsCollector;
use crate::relay::race_streams;
use crate::supervisor::Shutdown;

/// SSH server servicing `direct-streamlocal@openssh.com` channels.
///
/// Authentication accepts exactly one key: the configured identity's own
/// public key (an authorized-keys set of size one). Each accepted channel
/// names a Unix socket path, which is dialed and spliced onto the channel.
/// Authentication failures and channel rejections are per-session;
/// only bind errors take the server down.
pub struct SshServer {
  config: Arc<russh::server::Config>,
  identity: Arc<Identity>,
  buffer_size: usize,
  health: Arc<HealthChecker>,
  metrics: Arc<MetricsCollector>,
  shutdown: Shutdown,
}

impl SshServer {
  pub fn new(
    identity: Identity,
    buffer_size: usize,
    health: Arc<HealthChecker>,
    metrics: Arc<MetricsCollector>,
    shutdown: Shutdown,
  ) -> Self {
    let config = russh::server::Config {
      keys: vec![identity.key.clone()],
      auth_rejection_time: Duration::from_millis(100),
      auth_rejection_time_initial: Some(Duration::ZERO),
      inactivity_timeout: None,
      ..Default::default()
    };
    Self {
      config: Arc::new(config),
      identity: Arc::new(identity),
      buffer_size,
      health,
      metrics,
      shutdown,
    }
  }

  /// Accept TCP connections and run an SSH session on each until the
  /// shutdown handle fires.
  pub async fn serve(self, address: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address)
      .await
      .with_context(|| format!("unable to listen for SSH connections on {address}"))?;
    info!(event = "ssh_server_started", address, "SSH server listening");

    // Sessions live in their own task set so stopping the server also tears
    // down every in-flight session, not just the accept loop.
    let mut sessions = tokio::task::JoinSet::new();
    loop {
      tokio::select! {
        _ = self.shutdown.triggered() => break,
        Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        res = listener.accept() => {
          let (stream, peer) = match res {
            Ok(accepted) => accepted,
            Err(err) => {
              if self.shutdown.is_cancelled() {
                break;
              }
              return Err(err).context("SSH listener accept failed");
            }
          };
          debug!(peer = %peer, "accepted SSH connection");
          let handler = SessionHandler {
            identity: Arc::clone(&self.identity),
            buffer_size: self.buffer_size,
            health: Arc::clone(&self.health),
            metrics: Arc::clone(&self.metrics),
          };
          let config = Arc::clone(&self.config);
          sessions.spawn(async move {
            match russh::server::run_stream(config, stream, handler).await {
              Ok(session) => {
                if let Err(err) = session.await {
                  debug!(peer = %peer, error = %err, "SSH session ended with error");
                }
              }
              Err(err) => debug!(peer = %peer, error = %err, "SSH handshake failed"),
            }
          });
        }
      }
    }

    sessions.abort_all();
    while sessions.join_next().await.is_some() {}
    info!(event = "ssh_server_stopped", address, "SSH server stopped");
    Ok(())
  }
}

struct SessionHandler {
  identity: Arc<Identity>,
  buffer_size: usize,
  health: Arc<HealthChecker>,
  metrics: Arc<MetricsCollector>,
}

impl russh::server::Handler for SessionHandler {
  type Error = anyhow::Error;

  async fn auth_publickey_offered(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
    if self.identity.matches(public_key) {
      Ok(Auth::Accept)
    } else {
      debug!(user, "offered key is not the configured identity");
      Ok(Auth::Reject { proceed_with_methods: None, partial_success: false })
    }
  }

  async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
    debug!(user, "login attempt");
    if self.identity.matches(public_key) {
      let fingerprint = public_key.fingerprint(HashAlg::Sha256);
      info!(event = "session_authenticated", user, fingerprint = %fingerprint, "logged in");
      Ok(Auth::Accept)
    } else {
      warn!(event = "auth_rejected", user, "keys are not matching, unknown public key");
      Ok(Auth::Reject { proceed_with_methods: None, partial_success: false })
    }
  }

  async fn channel_open_direct_streamlocal(
    &mut self,
    channel: Channel<Msg>,
    socket_path: &str,
    _session: &mut Session,
  ) -> Result<bool, Self::Error> {
    if socket_path.is_empty() {
      debug!("channel socket path must be provided");
      return Ok(false);
    }

    debug!(socket_path, "connecting to socket");
    let sock = match UnixStream::connect(socket_path).await {
      Ok(sock) => sock,
      Err(err) => {
        debug!(socket_path, error = %err, "could not dial unix socket");
        self.metrics.record_socket_error();
        self.health.record_error(&err);
        return Ok(false);
      }
    };

    self.health.increment_connections();
    self.metrics.record_connection();

    let buffer_size = self.buffer_size;
    let health = Arc::clone(&self.health);
    let metrics = Arc::clone(&self.metrics);
    let socket_path = socket_path.to_string();
    tokio::spawn(async move {
      let started = Instant::now();
      // First EOF or error in either direction tears down both ends; the
      // channel and the socket are dropped together, not drained.
      let (inbound, outbound) = race_streams(channel.into_stream(), sock, buffer_size).await;
      metrics.record_bytes_read(inbound);
      metrics.record_bytes_written(outbound);
      metrics.record_disconnection(started.elapsed());
      health.decrement_connections();
      debug!(socket_path, inbound, outbound, "channel closed");
    });

    Ok(true)
  }
}
