use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::supervisor::Shutdown;

/// Platform-specific answer to "is this process still running?".
pub trait ProcessProbe: Send + Sync {
  fn is_alive(&self, pid: i32) -> impl Future<Output = bool> + Send;
}

/// Probe by sending the null signal: delivery succeeds (or is refused with
/// EPERM) for live processes, ESRCH means the pid is gone.
#[cfg(unix)]
pub struct SignalProbe;

#[cfg(unix)]
impl ProcessProbe for SignalProbe {
  async fn is_alive(&self, pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
      Ok(()) => true,
      Err(Errno::EPERM) => true,
      Err(Errno::ESRCH) => false,
      Err(errno) => {
        debug!(pid, errno = %errno, "unexpected error probing process");
        false
      }
    }
  }
}

/// Probe a Windows pid via `tasklist.exe` CSV output. Works both on Windows
/// proper and inside WSL, where Windows binaries run through interop.
pub struct TasklistProbe;

impl ProcessProbe for TasklistProbe {
  async fn is_alive(&self, pid: i32) -> bool {
    let output = tokio::process::Command::new("tasklist.exe")
      .args(["/fo", "CSV", "/fi", &format!("PID eq {pid}")])
      .output()
      .await;

    let output = match output {
      Ok(output) if output.status.success() => output,
      Ok(output) => {
        debug!(pid, status = %output.status, "tasklist.exe failed");
        return false;
      }
      Err(err) => {
        debug!(pid, error = %err, "unable to run tasklist.exe");
        return false;
      }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let needle = format!("\"{pid}\"");
    // A match yields a header row plus one record; filters with no match
    // print a one-line info message instead.
    stdout.lines().filter(|line| !line.trim().is_empty()).count() > 1 && stdout.contains(&needle)
  }
}

/// Poll the supervising process and trigger a graceful shutdown the first
/// time it is observed gone.
pub struct ParentWatcher<P> {
  probe: P,
  pid: i32,
  poll_interval: Duration,
  shutdown: Shutdown,
}

impl<P: ProcessProbe> ParentWatcher<P> {
  pub fn new(probe: P, pid: i32, poll_interval: Duration, shutdown: Shutdown) -> Self {
    Self { probe, pid, poll_interval, shutdown }
  }

  pub async fn watch(self) -> anyhow::Result<()> {
    if self.pid <= 0 {
      warn!(pid = self.pid, "no valid parent pid to watch");
      return Ok(());
    }

    info!(event = "watcher_started", pid = self.pid, "watching parent process");
    loop {
      tokio::select! {
        _ = self.shutdown.triggered() => return Ok(()),
        _ = tokio::time::sleep(self.poll_interval) => {
          if self.probe.is_alive(self.pid).await {
            trace!(pid = self.pid, "parent process is still running");
          } else {
            info!(event = "parent_gone", pid = self.pid, "parent process is no longer running, shutting down");
            self.shutdown.cancel();
            return Ok(());
          }
        }
      }
    }
  }
}
