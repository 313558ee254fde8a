//! Host-side role: accepted local connections become SSH channels into the
//! VM, optionally after spawning the VM-side relay program.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use sockbridge_core::config::Config;
use sockbridge_core::endpoint::Endpoint;
use sockbridge_core::forward::{Bastion, SshDestination, SshForward};
use sockbridge_core::health::{self, HealthChecker};
use sockbridge_core::keys;
use sockbridge_core::metrics::{self, MetricsCollector};
use sockbridge_core::pool::ConnectionPool;
use sockbridge_core::supervisor::{PeerProcess, Shutdown, Supervisor, spawn_peer};
use sockbridge_core::watcher::{ParentWatcher, TasklistProbe};
use tracing::{debug, info};

pub async fn run(config: Config) -> anyhow::Result<()> {
  let shutdown = Shutdown::new();
  let mut supervisor = Supervisor::new(shutdown.clone());

  let identity = keys::load_identity(&config.identity_path)?;
  let destination = SshDestination::parse(&config.ssh_connection)?;
  let local = Endpoint::parse(&config.named_pipe, config.pipe_permissions)?;

  // Refuse to start when another listener already owns the pipe.
  if let Some(endpoint @ Endpoint::NamedPipe { .. }) = &local {
    if endpoint.dial().await.is_ok() {
      anyhow::bail!("pipe already opened: {endpoint}");
    }
    debug!(endpoint = %endpoint, "pipe is not opened yet");
  }

  if let Some(relay_program) = config.relay_program_path.clone() {
    let peer = spawn_relay_program(&config, &relay_program).await?;
    supervisor.adopt_peer(peer);
  }

  let health = Arc::new(HealthChecker::new());
  let metrics = Arc::new(MetricsCollector::new());
  if config.health_check_enabled {
    supervisor.spawn("health", health::serve(config.health_check_port, Arc::clone(&health), shutdown.clone()));
  }
  if config.metrics_enabled {
    supervisor.spawn("metrics", metrics::serve(config.metrics_port, Arc::clone(&metrics), shutdown.clone()));
  }

  if config.watch_process_termination {
    let watcher =
      ParentWatcher::new(TasklistProbe, config.parent_process_pid, config.poll_interval(), shutdown.clone());
    supervisor.spawn("parent-watcher", watcher.watch());
  }

  let bastion = Arc::new(
    Bastion::connect(
      destination,
      config.known_hosts_path.clone(),
      config.connect_timeout(),
      config.max_retries,
      identity.key.clone(),
      &shutdown,
    )
    .await?,
  );
  info!(event = "forward_ready", ssh_connection = %config.ssh_connection, "connected to SSH server, setting up proxies");

  let pool = Arc::new(ConnectionPool::new(config.max_connections));
  let forward = SshForward::bind(
    local,
    bastion,
    pool,
    Arc::clone(&health),
    Arc::clone(&metrics),
    config.buffer_size,
    shutdown.clone(),
  )
  .await?;
  supervisor.spawn("ssh-forward", forward.serve());

  supervisor.run().await
}

/// Spawn the VM-side relay over WSL interop, translating Windows paths into
/// the distribution's filesystem first.
async fn spawn_relay_program(config: &Config, relay_program: &Path) -> anyhow::Result<PeerProcess> {
  let distribution = config
    .distribution
    .clone()
    .context("a distribution is required to spawn the relay program")?;

  let identity = wsl_path(&distribution, &config.identity_path).await?;
  let program = wsl_path(&distribution, relay_program).await?;

  let mut command = tokio::process::Command::new("wsl.exe");
  command
    .args(["--distribution", &distribution, "--exec", &program])
    .args(["--host", &config.host])
    .args(["--port", &config.port.to_string()])
    .args(["--buffer-size", &config.buffer_size.to_string()])
    .args(["--poll-interval", &config.poll_interval.to_string()])
    .args(["--identity-path", &identity])
    .args(["--parent-process-pid", &std::process::id().to_string()]);
  if config.watch_process_termination {
    command.arg("--watch-process-termination");
  }

  info!(distribution, program, "starting relay program");
  spawn_peer(command)
}

/// Translate a Windows path via `wslpath`; paths that already look like VM
/// paths pass through unchanged.
async fn wsl_path(distribution: &str, windows_path: &Path) -> anyhow::Result<String> {
  let raw = windows_path.to_string_lossy().into_owned();
  if raw.starts_with('/') {
    return Ok(raw);
  }

  let output = tokio::process::Command::new("wsl.exe")
    .args(["--distribution", distribution, "--exec", "wslpath", &raw])
    .output()
    .await
    .with_context(|| format!("unable to run wslpath for {raw}"))?;
  anyhow::ensure!(output.status.success(), "wslpath failed for {raw}");
  Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
