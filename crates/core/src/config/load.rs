use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::types::{Config, ConfigError, PipePermissions, Result};

/// Load configuration: defaults, overlaid with the JSON config file (when
/// present), overlaid with explicitly supplied flag values. A missing file
/// falls back to defaults; malformed JSON is fatal.
pub fn load(path: Option<&Path>, overrides: PartialConfig) -> Result<Config> {
  let mut cfg = Config::default();

  if let Some(path) = path {
    match fs::read_to_string(path) {
      Ok(raw) => {
        let partial: PartialConfig = serde_json::from_str(&raw)
          .map_err(|source| ConfigError::Json { path: path.to_path_buf(), source })?;
        cfg = partial.merge_over(cfg);
      }
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
        warn!(event = "config_missing", path = %path.display(), "config file not found, using defaults");
      }
      Err(source) => return Err(ConfigError::Io { path: path.to_path_buf(), source }),
    }
  }

  let cfg = overrides.merge_over(cfg);
  cfg.validate()?;
  Ok(cfg)
}

/// Persist the configuration as pretty-printed JSON.
pub fn save(cfg: &Config, path: &Path) -> Result<()> {
  let raw = serde_json::to_string_pretty(cfg)
    .map_err(|source| ConfigError::Json { path: path.to_path_buf(), source })?;
  fs::write(path, raw).map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
}

/// A sparse configuration layer. Missing fields keep the base value; both
/// the config file and the flag parser produce one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PartialConfig {
  pub host: Option<String>,
  pub port: Option<u16>,
  pub buffer_size: Option<usize>,
  pub identity_path: Option<PathBuf>,
  pub known_hosts_path: Option<PathBuf>,
  pub authorized_keys_path: Option<PathBuf>,
  pub max_connections: Option<usize>,
  pub max_retries: Option<u32>,
  pub ssh_timeout: Option<u64>,
  pub read_timeout: Option<u64>,
  pub write_timeout: Option<u64>,
  pub watch_process_termination: Option<bool>,
  pub parent_process_pid: Option<i32>,
  pub poll_interval: Option<u64>,
  pub named_pipe: Option<String>,
  pub pipe_permissions: Option<PipePermissions>,
  pub ssh_connection: Option<String>,
  pub relay_program_path: Option<PathBuf>,
  pub distribution: Option<String>,
  pub health_check_enabled: Option<bool>,
  pub health_check_port: Option<u16>,
  pub metrics_enabled: Option<bool>,
  pub metrics_port: Option<u16>,
  pub relay_socket: Option<PathBuf>,
  pub relay_address: Option<String>,
  pub relay_health_interval: Option<u64>,
  pub relay_buffer_size: Option<usize>,
}

impl PartialConfig {
  pub fn merge_over(self, base: Config) -> Config {
    let PartialConfig {
      host,
      port,
      buffer_size,
      identity_path,
      known_hosts_path,
      authorized_keys_path,
      max_connections,
      max_retries,
      ssh_timeout,
      read_timeout,
      write_timeout,
      watch_process_termination,
      parent_process_pid,
      poll_interval,
      named_pipe,
      pipe_permissions,
      ssh_connection,
      relay_program_path,
      distribution,
      health_check_enabled,
      health_check_port,
      metrics_enabled,
      metrics_port,
      relay_socket,
      relay_address,
      relay_health_interval,
      relay_buffer_size,
    } = self;

    Config {
      host: host.unwrap_or(base.host),
      port: port.unwrap_or(base.port),
      buffer_size: buffer_size.unwrap_or(base.buffer_size),
      identity_path: identity_path.unwrap_or(base.identity_path),
      known_hosts_path: known_hosts_path.unwrap_or(base.known_hosts_path),
      authorized_keys_path: authorized_keys_path.unwrap_or(base.authorized_keys_path),
      max_connections: max_connections.unwrap_or(base.max_connections),
      max_retries: max_retries.unwrap_or(base.max_retries),
      ssh_timeout: ssh_timeout.unwrap_or(base.ssh_timeout),
      read_timeout: read_timeout.unwrap_or(base.read_timeout),
      write_timeout: write_timeout.unwrap_or(base.write_timeout),
      watch_process_termination: watch_process_termination.unwrap_or(base.watch_process_termination),
      parent_process_pid: parent_process_pid.unwrap_or(base.parent_process_pid),
      poll_interval: poll_interval.unwrap_or(base.poll_interval),
      named_pipe: named_pipe.unwrap_or(base.named_pipe),
      pipe_permissions: pipe_permissions.unwrap_or(base.pipe_permissions),
      ssh_connection: ssh_connection.unwrap_or(base.ssh_connection),
      relay_program_path: relay_program_path.or(base.relay_program_path),
      distribution: distribution.or(base.distribution),
      health_check_enabled: health_check_enabled.unwrap_or(base.health_check_enabled),
      health_check_port: health_check_port.unwrap_or(base.health_check_port),
      metrics_enabled: metrics_enabled.unwrap_or(base.metrics_enabled),
      metrics_port: metrics_port.unwrap_or(base.metrics_port),
      relay_socket: relay_socket.or(base.relay_socket),
      relay_address: relay_address.or(base.relay_address),
      relay_health_interval: relay_health_interval.unwrap_or(base.relay_health_interval),
      relay_buffer_size: relay_buffer_size.unwrap_or(base.relay_buffer_size),
    }
  }
}
