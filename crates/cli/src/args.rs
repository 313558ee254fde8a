use std::path::PathBuf;

use clap::Parser;
use sockbridge_core::config::{PartialConfig, PipePermissions};

/// Flat flag surface; every flag has a config-file key of the same name.
/// Flags that were not given fall back to the config file, then defaults.
#[derive(Debug, Parser)]
#[command(version, about = "Cross-host container engine socket relay", bin_name = "sockbridge")]
pub struct Cli {
  /// Path to the JSON configuration file
  #[arg(long)]
  pub config_path: Option<PathBuf>,
  /// The SSH server listen host
  #[arg(long)]
  pub host: Option<String>,
  /// The SSH server listen port (default 20022)
  #[arg(long)]
  pub port: Option<u16>,
  /// The I/O buffer size in bytes (minimum 1024)
  #[arg(long)]
  pub buffer_size: Option<usize>,
  /// Path to the SSH connection private key
  #[arg(long)]
  pub identity_path: Option<PathBuf>,
  /// Path to the SSH known hosts file
  #[arg(long)]
  pub known_hosts_path: Option<PathBuf>,
  /// Path to the SSH authorized keys file
  #[arg(long)]
  pub authorized_keys_path: Option<PathBuf>,
  /// Generate an SSH RSA key pair, overwriting an existing one
  #[arg(long)]
  pub generate_key_pair: bool,
  /// Watch for supervising process termination
  #[arg(long)]
  pub watch_process_termination: bool,
  /// Pid of the supervising process (a Windows pid under WSL)
  #[arg(long)]
  pub parent_process_pid: Option<i32>,
  /// Parent process polling interval in seconds
  #[arg(long)]
  pub poll_interval: Option<u64>,
  /// Maximum number of retries to connect to the SSH server
  #[arg(long)]
  pub max_retries: Option<u32>,
  /// The SSH connection timeout in seconds
  #[arg(long)]
  pub ssh_timeout: Option<u64>,
  /// Per-read idle deadline in seconds
  #[arg(long)]
  pub read_timeout: Option<u64>,
  /// Per-write idle deadline in seconds
  #[arg(long)]
  pub write_timeout: Option<u64>,
  /// Bound on concurrently tunneled connections
  #[arg(long)]
  pub max_connections: Option<usize>,
  /// Local endpoint to relay through (npipe://... or unix://...; empty = tunnel only)
  #[arg(long)]
  pub named_pipe: Option<String>,
  /// Named pipe permissions preset
  #[arg(long)]
  pub pipe_permissions: Option<PipePermissions>,
  /// The destination SSH URL, e.g. ssh://user@host:20022/run/docker.sock
  #[arg(long)]
  pub ssh_connection: Option<String>,
  /// Path to the relay program spawned inside the distribution
  #[arg(long)]
  pub relay_program_path: Option<PathBuf>,
  /// The WSL distribution (defaults from WSL_DISTRO_NAME)
  #[arg(long)]
  pub distribution: Option<String>,
  /// Enable or disable the health endpoint
  #[arg(long)]
  pub health_check_enabled: Option<bool>,
  /// Health endpoint port
  #[arg(long)]
  pub health_check_port: Option<u16>,
  /// Enable or disable the metrics endpoint
  #[arg(long)]
  pub metrics_enabled: Option<bool>,
  /// Metrics endpoint port
  #[arg(long)]
  pub metrics_port: Option<u16>,
  /// Source Unix socket for the Unix-to-TCP relay role
  #[arg(long)]
  pub relay_socket: Option<PathBuf>,
  /// Target TCP address for the Unix-to-TCP relay role
  #[arg(long)]
  pub relay_address: Option<String>,
  /// Liveness probe interval for the Unix-to-TCP relay in seconds
  #[arg(long)]
  pub relay_health_interval: Option<u64>,
  /// Buffer size in bytes for the Unix-to-TCP relay
  #[arg(long)]
  pub relay_buffer_size: Option<usize>,
}

impl Cli {
  /// The flag layer of the configuration. Bare boolean switches only
  /// override when set; absent value flags leave the base untouched.
  pub fn overrides(&self) -> PartialConfig {
    PartialConfig {
      host: self.host.clone(),
      port: self.port,
      buffer_size: self.buffer_size,
      identity_path: self.identity_path.clone(),
      known_hosts_path: self.known_hosts_path.clone(),
      authorized_keys_path: self.authorized_keys_path.clone(),
      max_connections: self.max_connections,
      max_retries: self.max_retries,
      ssh_timeout: self.ssh_timeout,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      watch_process_termination: self.watch_process_termination.then_some(true),
      parent_process_pid: self.parent_process_pid,
      poll_interval: self.poll_interval,
      named_pipe: self.named_pipe.clone(),
      pipe_permissions: self.pipe_permissions,
      ssh_connection: self.ssh_connection.clone(),
      relay_program_path: self.relay_program_path.clone(),
      distribution: self.distribution.clone(),
      health_check_enabled: self.health_check_enabled,
      health_check_port: self.health_check_port,
      metrics_enabled: self.metrics_enabled,
      metrics_port: self.metrics_port,
      relay_socket: self.relay_socket.clone(),
      relay_address: self.relay_address.clone(),
      relay_health_interval: self.relay_health_interval,
      relay_buffer_size: self.relay_buffer_size,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flags_map_into_the_override_layer() {
    let cli = Cli::parse_from([
      "sockbridge",
      "--port",
      "30022",
      "--buffer-size",
      "4096",
      "--watch-process-termination",
      "--parent-process-pid",
      "4242",
      "--pipe-permissions",
      "AllowEveryone",
      "--ssh-connection",
      "ssh://core@127.0.0.1:30022/run/docker.sock",
    ]);

    let overrides = cli.overrides();
    assert_eq!(overrides.port, Some(30022));
    assert_eq!(overrides.buffer_size, Some(4096));
    assert_eq!(overrides.watch_process_termination, Some(true));
    assert_eq!(overrides.parent_process_pid, Some(4242));
    assert_eq!(overrides.pipe_permissions, Some(PipePermissions::AllowEveryone));
    assert_eq!(overrides.ssh_connection.as_deref(), Some("ssh://core@127.0.0.1:30022/run/docker.sock"));
    assert_eq!(overrides.host, None);
  }

  #[test]
  fn absent_switches_do_not_override() {
    let cli = Cli::parse_from(["sockbridge"]);
    let overrides = cli.overrides();
    assert_eq!(overrides.watch_process_termination, None);
    assert_eq!(overrides.health_check_enabled, None);
  }
}
