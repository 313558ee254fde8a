//! VM-side role: SSH server plus the optional Unix-to-TCP relay.

use std::sync::Arc;

use sockbridge_core::config::Config;
use sockbridge_core::endpoint::Endpoint;
use sockbridge_core::health::{self, HealthChecker};
use sockbridge_core::keys;
use sockbridge_core::metrics::{self, MetricsCollector};
use sockbridge_core::relay::DuplexRelay;
use sockbridge_core::server::SshServer;
use sockbridge_core::supervisor::{Shutdown, Supervisor};
use sockbridge_core::watcher::{ParentWatcher, SignalProbe, TasklistProbe};
use tracing::debug;

pub async fn run(config: Config) -> anyhow::Result<()> {
  #[cfg(target_os = "linux")]
  sockbridge_core::supervisor::arrange_parent_death_signal();

  let shutdown = Shutdown::new();
  let mut supervisor = Supervisor::new(shutdown.clone());

  let identity = keys::load_identity(&config.identity_path)?;

  let health = Arc::new(HealthChecker::new());
  let metrics = Arc::new(MetricsCollector::new());
  if config.health_check_enabled {
    supervisor.spawn("health", health::serve(config.health_check_port, Arc::clone(&health), shutdown.clone()));
  }
  if config.metrics_enabled {
    supervisor.spawn("metrics", metrics::serve(config.metrics_port, Arc::clone(&metrics), shutdown.clone()));
  }

  if config.watch_process_termination {
    debug!(pid = config.parent_process_pid, "watching process termination");
    // Inside WSL the supervising pid is a Windows pid, reachable only
    // through tasklist.exe interop; elsewhere the null signal works.
    if std::env::var_os("WSL_DISTRO_NAME").is_some() {
      let watcher =
        ParentWatcher::new(TasklistProbe, config.parent_process_pid, config.poll_interval(), shutdown.clone());
      supervisor.spawn("parent-watcher", watcher.watch());
    } else {
      let watcher =
        ParentWatcher::new(SignalProbe, config.parent_process_pid, config.poll_interval(), shutdown.clone());
      supervisor.spawn("parent-watcher", watcher.watch());
    }
  } else {
    debug!("not watching process termination");
  }

  let server = SshServer::new(
    identity,
    config.buffer_size,
    Arc::clone(&health),
    Arc::clone(&metrics),
    shutdown.clone(),
  );
  let address = config.listen_address();
  supervisor.spawn("ssh-server", async move { server.serve(&address).await });

  if let (Some(socket), Some(address)) = (config.relay_socket.clone(), config.relay_address.clone()) {
    let target = Endpoint::parse(&address, config.pipe_permissions)?
      .ok_or_else(|| anyhow::anyhow!("blank/empty relay address"))?;
    let relay = DuplexRelay::new(
      Endpoint::Unix(socket),
      target,
      config.relay_buffer_size,
      config.relay_health_interval(),
      config.read_deadline(),
      config.write_deadline(),
      shutdown.clone(),
    );
    supervisor.spawn("unix-tcp-relay", relay.run());
  }

  supervisor.run().await
}
