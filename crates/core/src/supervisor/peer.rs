use std::process::Stdio;

use anyhow::Context;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// A spawned relay peer (the program running on the other side of the VM
/// boundary). Killed by pid, and on POSIX also by process-group id, when
/// the supervisor shuts down.
pub struct PeerProcess {
  child: Child,
  #[cfg(unix)]
  pgid: Option<i32>,
}

/// Spawn the peer with stdout/stderr inherited so its logs interleave with
/// ours. On POSIX the child is placed in its own process group so the whole
/// group can be killed.
pub fn spawn_peer(mut command: Command) -> anyhow::Result<PeerProcess> {
  command.stdin(Stdio::null()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
  #[cfg(unix)]
  command.process_group(0);

  let child = command.spawn().context("unable to start relay peer process")?;
  let pid = child.id();
  info!(event = "peer_started", pid, "relay peer process started");

  #[cfg(unix)]
  let pgid = pid.map(|p| p as i32);

  Ok(PeerProcess {
    child,
    #[cfg(unix)]
    pgid,
  })
}

impl PeerProcess {
  pub fn pid(&self) -> Option<u32> {
    self.child.id()
  }

  /// Terminate the peer and reap it. Errors are logged only; the peer may
  /// already be gone.
  pub async fn kill(mut self) {
    let pid = self.child.id();
    debug!(event = "peer_kill", pid, "killing relay peer process");

    #[cfg(unix)]
    if let Some(pgid) = self.pgid {
      use nix::sys::signal::{Signal, killpg};
      use nix::unistd::Pid;
      if let Err(errno) = killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
        debug!(event = "peer_killpg_failed", pgid, errno = %errno, "unable to signal peer process group");
      }
    }

    if let Err(err) = self.child.kill().await {
      debug!(event = "peer_kill_failed", pid, error = %err, "unable to kill peer process");
    }
    let _ = self.child.wait().await;
  }
}
