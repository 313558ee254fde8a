use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Security descriptor presets for the host-side named pipe.
///
/// The SDDL strings mirror the docker plugin helper conventions; `$SID` is
/// substituted with the current user's SID at listen time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PipePermissions {
  AllowEveryone,
  #[default]
  AllowCurrentUser,
  AllowServiceSystemAdmin,
}

impl PipePermissions {
  pub fn descriptor(&self) -> &'static str {
    match self {
      // Full access for everyone.
      PipePermissions::AllowEveryone => "S:(ML;;NW;;;LW)D:(A;;0x12019f;;;WD)",
      // Full access for the current user only.
      PipePermissions::AllowCurrentUser => "D:P(A;;GA;;;$SID)",
      // Full access for Service, System and the Administrator group/account.
      PipePermissions::AllowServiceSystemAdmin => "D:(A;ID;FA;;;SY)(A;ID;FA;;;BA)(A;ID;FA;;;LA)(A;ID;FA;;;LS)",
    }
  }
}

impl FromStr for PipePermissions {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "AllowEveryone" => Ok(PipePermissions::AllowEveryone),
      "AllowCurrentUser" => Ok(PipePermissions::AllowCurrentUser),
      "AllowServiceSystemAdmin" => Ok(PipePermissions::AllowServiceSystemAdmin),
      other => Err(ConfigError::UnknownPipePermissions { value: other.to_string() }),
    }
  }
}

/// Effective configuration after merging defaults, the JSON config file,
/// and command-line flags. Field names match the flag names (snake_case);
/// durations are expressed in whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
  /// SSH server listen host
  pub host: String,
  /// SSH server listen port
  pub port: u16,
  /// Splice buffer size in bytes for the SSH side
  pub buffer_size: usize,
  pub identity_path: PathBuf,
  pub known_hosts_path: PathBuf,
  pub authorized_keys_path: PathBuf,
  /// Bound on concurrently tunneled connections
  pub max_connections: usize,
  /// Client connect retries before giving up
  pub max_retries: u32,
  /// SSH dial/handshake timeout in seconds
  pub ssh_timeout: u64,
  /// Per-read idle deadline in seconds
  pub read_timeout: u64,
  /// Per-write idle deadline in seconds
  pub write_timeout: u64,
  /// Watch the supervising process and shut down when it disappears
  pub watch_process_termination: bool,
  /// Pid of the supervising process (-1 = unset)
  pub parent_process_pid: i32,
  /// Parent liveness polling interval in seconds
  pub poll_interval: u64,
  /// Host-side local endpoint (`npipe://...` or `unix://...`; empty = tunnel only)
  pub named_pipe: String,
  pub pipe_permissions: PipePermissions,
  /// Destination SSH URL, e.g. `ssh://core@127.0.0.1:20022`
  pub ssh_connection: String,
  /// Peer relay program to spawn inside the distribution (host side only)
  pub relay_program_path: Option<PathBuf>,
  /// WSL distribution name; defaults from `WSL_DISTRO_NAME`
  pub distribution: Option<String>,
  pub health_check_enabled: bool,
  pub health_check_port: u16,
  pub metrics_enabled: bool,
  pub metrics_port: u16,
  /// Source Unix socket for the Unix-to-TCP relay role
  pub relay_socket: Option<PathBuf>,
  /// Target TCP address for the Unix-to-TCP relay role
  pub relay_address: Option<String>,
  /// Source liveness probe interval for the Unix-to-TCP relay, in seconds
  pub relay_health_interval: u64,
  /// Splice buffer size in bytes for the Unix-to-TCP relay
  pub relay_buffer_size: usize,
}

impl Default for Config {
  fn default() -> Self {
    let ssh_dir = home_dir().join(".ssh");
    Self {
      host: "127.0.0.1".to_string(),
      port: 20022,
      buffer_size: 8192,
      identity_path: ssh_dir.join("id_rsa"),
      known_hosts_path: ssh_dir.join("known_hosts"),
      authorized_keys_path: ssh_dir.join("authorized_keys"),
      max_connections: 100,
      max_retries: 5,
      ssh_timeout: 5,
      read_timeout: 30,
      write_timeout: 30,
      watch_process_termination: false,
      parent_process_pid: -1,
      poll_interval: 2,
      named_pipe: String::new(),
      pipe_permissions: PipePermissions::default(),
      ssh_connection: String::new(),
      relay_program_path: None,
      distribution: env::var("WSL_DISTRO_NAME").ok().filter(|v| !v.is_empty()),
      health_check_enabled: true,
      health_check_port: 20080,
      metrics_enabled: true,
      metrics_port: 20090,
      relay_socket: None,
      relay_address: None,
      relay_health_interval: 30,
      relay_buffer_size: 16384,
    }
  }
}

impl Config {
  pub fn listen_address(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.ssh_timeout)
  }

  pub fn read_deadline(&self) -> Duration {
    Duration::from_secs(self.read_timeout)
  }

  pub fn write_deadline(&self) -> Duration {
    Duration::from_secs(self.write_timeout)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval)
  }

  pub fn relay_health_interval(&self) -> Duration {
    Duration::from_secs(self.relay_health_interval)
  }
}

fn home_dir() -> PathBuf {
  env::var_os("HOME")
    .or_else(|| env::var_os("USERPROFILE"))
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse config file {path}: {source}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("failed to write config file {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("invalid port: {port}")]
  InvalidPort { port: u16 },
  #[error("buffer size too small: {size}")]
  BufferTooSmall { size: usize },
  #[error("max connections must be positive: {value}")]
  InvalidMaxConnections { value: usize },
  #[error("invalid health check port: {port}")]
  InvalidHealthCheckPort { port: u16 },
  #[error("invalid metrics port: {port}")]
  InvalidMetricsPort { port: u16 },
  #[error("unknown pipe permissions: {value}")]
  UnknownPipePermissions { value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
