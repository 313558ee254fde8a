use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use russh::Channel;
use russh::client::{self, Handle};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::supervisor::Shutdown;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const RETRY_SPACING: Duration = Duration::from_millis(200);
/// Additional channel-open attempts after the first failure.
const CHANNEL_RETRIES: u32 = 2;
/// Additional reconnect attempts after the first failure.
const RECONNECT_RETRIES: u32 = 2;

/// Where the bastion lives and which remote socket its channels target,
/// parsed from an `ssh://user@host:port/socket/path` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshDestination {
  pub user: String,
  pub host: String,
  pub port: u16,
  /// Remote Unix socket path requested on every channel.
  pub path: String,
}

impl SshDestination {
  pub fn parse(url: &str) -> anyhow::Result<Self> {
    let rest = url.strip_prefix("ssh://").with_context(|| format!("unsupported SSH URL: {url}"))?;
    let (authority, path) = match rest.find('/') {
      Some(idx) => (&rest[..idx], rest[idx..].to_string()),
      None => (rest, String::new()),
    };
    let (user, host_port) =
      authority.split_once('@').with_context(|| format!("missing user in SSH URL: {url}"))?;
    anyhow::ensure!(!user.is_empty(), "missing user in SSH URL: {url}");

    let (host, port) = match host_port.rsplit_once(':') {
      Some((host, port)) => {
        (host.to_string(), port.parse::<u16>().with_context(|| format!("invalid port in SSH URL: {url}"))?)
      }
      None => (host_port.to_string(), 22),
    };
    anyhow::ensure!(!host.is_empty(), "missing host in SSH URL: {url}");

    Ok(Self { user: user.to_string(), host, port, path })
  }

  pub fn address(&self) -> String {
    format!("{}@{}:{}", self.user, self.host, self.port)
  }
}

/// Host-key policy: pin to the known-hosts entry when one exists for this
/// host, otherwise accept whatever the server presents. An entry that no
/// longer matches rejects the connection.
struct HostKeyPolicy {
  host: String,
  port: u16,
  known_hosts_path: PathBuf,
}

impl client::Handler for HostKeyPolicy {
  type Error = anyhow::Error;

  async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
    match russh::keys::check_known_hosts_path(&self.host, self.port, server_public_key, &self.known_hosts_path)
    {
      Ok(true) => Ok(true),
      Ok(false) => {
        debug!(host = %self.host, "no known hosts entry, accepting server key");
        Ok(true)
      }
      Err(err @ russh::keys::Error::KeyChanged { .. }) => {
        warn!(host = %self.host, error = %err, "server key rejected by known hosts");
        Ok(false)
      }
      Err(err) => {
        // An unreadable or absent known-hosts file downgrades to
        // accept-anything, like an unknown host does.
        debug!(host = %self.host, error = %err, "known hosts lookup failed, accepting server key");
        Ok(true)
      }
    }
  }
}

/// A managed SSH client session multiplexing inbound connections as
/// `direct-streamlocal@openssh.com` channels.
///
/// The session sits behind a mutex so at most one reconnect runs at a time;
/// a caller either gets a working session or an error naming the host and
/// target path.
pub struct Bastion {
  destination: SshDestination,
  known_hosts_path: PathBuf,
  connect_timeout: Duration,
  key: Arc<PrivateKey>,
  session: Mutex<Handle<HostKeyPolicy>>,
}

impl std::fmt::Debug for Bastion {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Bastion")
      .field("destination", &self.destination)
      .field("known_hosts_path", &self.known_hosts_path)
      .field("connect_timeout", &self.connect_timeout)
      .finish_non_exhaustive()
  }
}

impl Bastion {
  /// Dial and authenticate, retrying with exponential backoff (100 ms
  /// doubling, capped at 1 s) up to `max_retries` attempts. Failure after
  /// the retries is fatal for the forward.
  pub async fn connect(
    destination: SshDestination,
    known_hosts_path: PathBuf,
    connect_timeout: Duration,
    max_retries: u32,
    key: PrivateKey,
    shutdown: &Shutdown,
  ) -> anyhow::Result<Self> {
    let key = Arc::new(key);
    let mut backoff = INITIAL_BACKOFF;
    let mut last_error = anyhow::anyhow!("no connection attempts made");

    for _attempt in 0..max_retries.max(1) {
      if shutdown.is_cancelled() {
        anyhow::bail!("cancelled while connecting to {}", destination.address());
      }
      match establish(&destination, &known_hosts_path, connect_timeout, Arc::clone(&key)).await {
        Ok(session) => {
          info!(event = "bastion_connected", destination = %destination.address(), "connected to SSH server");
          return Ok(Self {
            destination,
            known_hosts_path,
            connect_timeout,
            key,
            session: Mutex::new(session),
          });
        }
        Err(err) => {
          debug!(destination = %destination.address(), backoff = ?backoff, error = format!("{err:#}"), "waiting for sshd");
          last_error = err;
        }
      }
      shutdown.sleep(backoff).await;
      backoff = next_backoff(backoff);
    }

    Err(last_error.context(format!("unable to connect to SSH server at {}", destination.address())))
  }

  pub fn target_path(&self) -> &str {
    &self.destination.path
  }

  /// Open a channel to the configured remote socket path.
  ///
  /// On failure: probe session liveness, reconnect when it is dead (up to
  /// two more attempts, 200 ms apart), and retry the open up to two more
  /// times. The error after exhaustion is the caller's to log; it only ever
  /// costs the one inbound connection.
  pub async fn open_channel(&self, shutdown: &Shutdown) -> anyhow::Result<Channel<client::Msg>> {
    let mut session = self.session.lock().await;

    let mut attempt = 0u32;
    loop {
      match session.channel_open_direct_streamlocal(&self.destination.path).await {
        Ok(channel) => return Ok(channel),
        Err(err) => {
          debug!(attempt, error = %err, path = %self.destination.path, "channel open failed");
          if attempt >= CHANNEL_RETRIES {
            return Err(anyhow::Error::from(err).context(format!(
              "couldn't reestablish ssh tunnel on path {}",
              self.destination.path
            )));
          }

          if !probe(&session).await {
            self.reconnect(&mut session, shutdown).await?;
          }
          if !shutdown.sleep(RETRY_SPACING).await {
            anyhow::bail!("cancelled while opening channel to {}", self.destination.path);
          }
          attempt += 1;
        }
      }
    }
  }

  async fn reconnect(&self, session: &mut Handle<HostKeyPolicy>, shutdown: &Shutdown) -> anyhow::Result<()> {
    info!(event = "bastion_reconnect", destination = %self.destination.address(), "reconnecting SSH session");
    let mut last_error = anyhow::anyhow!("no reconnect attempts made");

    for attempt in 0..=RECONNECT_RETRIES {
      if attempt > 0 && !shutdown.sleep(RETRY_SPACING).await {
        anyhow::bail!("cancelled while reconnecting to {}", self.destination.address());
      }
      match establish(&self.destination, &self.known_hosts_path, self.connect_timeout, Arc::clone(&self.key))
        .await
      {
        Ok(new_session) => {
          *session = new_session;
          info!(event = "bastion_reconnected", destination = %self.destination.address(), "SSH session reestablished");
          return Ok(());
        }
        Err(err) => {
          debug!(attempt, error = format!("{err:#}"), "reconnect attempt failed");
          last_error = err;
        }
      }
    }

    Err(
      last_error
        .context(format!("couldn't reestablish ssh connection to {}", self.destination.host)),
    )
  }
}

async fn establish(
  destination: &SshDestination,
  known_hosts_path: &std::path::Path,
  connect_timeout: Duration,
  key: Arc<PrivateKey>,
) -> anyhow::Result<Handle<HostKeyPolicy>> {
  debug!(destination = %destination.address(), "dialing SSH server");
  let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((destination.host.as_str(), destination.port)))
    .await
    .map_err(|_| anyhow::anyhow!("connection to {} timed out", destination.address()))?
    .with_context(|| format!("unable to dial {}", destination.address()))?;

  let config = Arc::new(client::Config::default());
  let handler = HostKeyPolicy {
    host: destination.host.clone(),
    port: destination.port,
    known_hosts_path: known_hosts_path.to_path_buf(),
  };
  let mut session = client::connect_stream(config, tcp, handler)
    .await
    .with_context(|| format!("SSH handshake with {} failed", destination.address()))?;

  let rsa_hash = session.best_supported_rsa_hash().await?.flatten();
  let auth = session
    .authenticate_publickey(&destination.user, PrivateKeyWithHashAlg::new(key, rsa_hash))
    .await
    .with_context(|| format!("authentication with {} failed", destination.address()))?;
  anyhow::ensure!(auth.success(), "publickey authentication rejected for {}", destination.address());

  // The keepalive round-trip proves the peer dispatches requests, not just
  // that the transport is up.
  anyhow::ensure!(probe(&session).await, "SSH server at {} is not answering", destination.address());

  Ok(session)
}

/// Liveness probe: a channel open round-trip. A rejection still proves the
/// peer is alive; only transport-level failures count as dead.
async fn probe(session: &Handle<HostKeyPolicy>) -> bool {
  if session.is_closed() {
    return false;
  }
  match session.channel_open_session().await {
    Ok(channel) => {
      drop(channel);
      true
    }
    Err(russh::Error::ChannelOpenFailure(_)) => true,
    Err(err) => {
      debug!(error = %err, "liveness probe failed");
      false
    }
  }
}

fn next_backoff(delay: Duration) -> Duration {
  let doubled = if delay.is_zero() { Duration::from_millis(5) } else { delay * 2 };
  doubled.min(MAX_BACKOFF)
}
