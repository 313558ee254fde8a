use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

mod peer;

pub use peer::{PeerProcess, spawn_peer};

/// How long workers get to observe cancellation before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Cancellation handle distributed to every component.
///
/// Cloning is cheap; all clones observe the same state. Components wait on
/// [`Shutdown::triggered`] inside their `select!` loops and check
/// [`Shutdown::is_cancelled`] for non-blocking decisions (pool admission
/// checks cancellation before permit availability).
#[derive(Clone, Debug)]
pub struct Shutdown {
  tx: watch::Sender<bool>,
}

impl Shutdown {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(false);
    Self { tx }
  }

  /// Signal cancellation. Idempotent and safe from any task.
  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.tx.borrow()
  }

  /// Completes once cancellation has been signalled.
  pub async fn triggered(&self) {
    let mut rx = self.tx.subscribe();
    loop {
      if *rx.borrow_and_update() {
        return;
      }
      if rx.changed().await.is_err() {
        return;
      }
    }
  }

  /// A handle that is cancelled when `self` is, but can also be cancelled
  /// independently without affecting the parent.
  pub fn child(&self) -> Shutdown {
    let child = Shutdown::new();
    let parent = self.clone();
    let linked = child.clone();
    tokio::spawn(async move {
      parent.triggered().await;
      linked.cancel();
    });
    child
  }

  /// Sleep that is interrupted by cancellation. Returns `false` when the
  /// shutdown fired before the full wait elapsed.
  pub async fn sleep(&self, wait: Duration) -> bool {
    tokio::select! {
      _ = self.triggered() => false,
      _ = tokio::time::sleep(wait) => true,
    }
  }
}

impl Default for Shutdown {
  fn default() -> Self {
    Self::new()
  }
}

/// Top-level lifecycle owner.
///
/// Holds the root [`Shutdown`], the managed worker set, and (optionally) a
/// spawned peer process. The first worker error cancels the rest; a
/// termination signal does the same. The peer process is killed as soon as
/// cancellation is observed, then remaining workers get [`SHUTDOWN_GRACE`]
/// to drain before being aborted.
pub struct Supervisor {
  shutdown: Shutdown,
  workers: JoinSet<anyhow::Result<()>>,
  peer: Option<PeerProcess>,
}

impl Supervisor {
  pub fn new(shutdown: Shutdown) -> Self {
    Self { shutdown, workers: JoinSet::new(), peer: None }
  }

  pub fn shutdown(&self) -> Shutdown {
    self.shutdown.clone()
  }

  /// Register a managed worker. Its error (if any) becomes the supervisor's
  /// result and cancels every other worker.
  pub fn spawn<F>(&mut self, name: &'static str, fut: F)
  where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    self.workers.spawn(async move { fut.await.with_context(|| format!("{name} worker failed")) });
  }

  /// Adopt a spawned peer process; it is killed on shutdown.
  pub fn adopt_peer(&mut self, peer: PeerProcess) {
    self.peer = Some(peer);
  }

  /// Drive the workers until completion or cancellation.
  pub async fn run(mut self) -> anyhow::Result<()> {
    let signal_shutdown = self.shutdown.clone();
    tokio::spawn(wait_for_signal(signal_shutdown));

    let mut first_error: Option<anyhow::Error> = None;
    loop {
      tokio::select! {
        _ = self.shutdown.triggered() => break,
        res = self.workers.join_next() => match res {
          None => break,
          Some(Ok(Ok(()))) => {}
          Some(Ok(Err(err))) => {
            error!(event = "worker_failed", error = format!("{err:#}"), "worker failed");
            if first_error.is_none() {
              first_error = Some(err);
            }
            self.shutdown.cancel();
          }
          Some(Err(join_err)) => {
            error!(event = "worker_panicked", error = %join_err, "worker panicked");
            if first_error.is_none() {
              first_error = Some(anyhow::anyhow!(join_err).context("worker panicked"));
            }
            self.shutdown.cancel();
          }
        }
      }
    }

    self.shutdown.cancel();

    if let Some(peer) = self.peer.take() {
      peer.kill().await;
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
      while let Some(res) = self.workers.join_next().await {
        match res {
          Ok(Ok(())) => {}
          Ok(Err(err)) => debug!(event = "worker_stopped", error = format!("{err:#}"), "worker stopped with error"),
          Err(join_err) => debug!(event = "worker_stopped", error = %join_err, "worker join error"),
        }
      }
    })
    .await;
    if drained.is_err() {
      warn!(event = "shutdown_grace_elapsed", "workers did not observe cancellation in time; aborting");
      self.workers.abort_all();
      while self.workers.join_next().await.is_some() {}
    }

    info!(event = "supervisor_stopped", "supervisor stopped");
    match first_error {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }
}

/// Wait for the first interrupt/termination signal, cancel, and stop
/// listening (so repeated signals cannot re-enter the shutdown path).
async fn wait_for_signal(shutdown: Shutdown) {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = match signal(SignalKind::interrupt()) {
      Ok(s) => s,
      Err(err) => {
        error!(error = %err, "unable to install signal handler");
        return;
      }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
      Ok(s) => s,
      Err(err) => {
        error!(error = %err, "unable to install signal handler");
        return;
      }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
      Ok(s) => s,
      Err(err) => {
        error!(error = %err, "unable to install signal handler");
        return;
      }
    };
    let mut quit = match signal(SignalKind::quit()) {
      Ok(s) => s,
      Err(err) => {
        error!(error = %err, "unable to install signal handler");
        return;
      }
    };

    tokio::select! {
      _ = shutdown.triggered() => return,
      _ = interrupt.recv() => {}
      _ = terminate.recv() => {}
      _ = hangup.recv() => {}
      _ = quit.recv() => {}
    }
  }

  #[cfg(windows)]
  {
    tokio::select! {
      _ = shutdown.triggered() => return,
      res = tokio::signal::ctrl_c() => {
        if let Err(err) = res {
          error!(error = %err, "unable to listen for ctrl-c");
          return;
        }
      }
    }
  }

  info!(event = "signal_received", "received termination signal");
  shutdown.cancel();
}

/// Ask the kernel to deliver SIGKILL if this process is orphaned.
///
/// Exits with `127 + errno` when the prctl call fails, before any worker
/// has started.
#[cfg(target_os = "linux")]
pub fn arrange_parent_death_signal() {
  use nix::sys::prctl::set_pdeathsig;
  use nix::sys::signal::Signal;

  if let Err(errno) = set_pdeathsig(Signal::SIGKILL) {
    debug!(event = "pdeathsig_failed", errno = errno as i32, "unable to set parent death signal");
    std::process::exit(127 + errno as i32);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn cancel_is_observed_by_all_clones() {
    let shutdown = Shutdown::new();
    let observer = shutdown.clone();
    assert!(!observer.is_cancelled());

    shutdown.cancel();
    assert!(observer.is_cancelled());
    // triggered resolves immediately once cancelled
    observer.triggered().await;
  }

  #[tokio::test]
  async fn child_follows_parent_but_not_vice_versa() {
    let parent = Shutdown::new();
    let child = parent.child();

    child.cancel();
    assert!(child.is_cancelled());
    assert!(!parent.is_cancelled());

    let parent2 = Shutdown::new();
    let child2 = parent2.child();
    parent2.cancel();
    child2.triggered().await;
    assert!(child2.is_cancelled());
  }

  #[tokio::test(start_paused = true)]
  async fn sleep_is_interrupted_by_cancellation() {
    let shutdown = Shutdown::new();
    let sleeper = shutdown.clone();
    let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(3600)).await });
    shutdown.cancel();
    assert!(!handle.await.unwrap());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn first_worker_error_cancels_the_rest() {
    let shutdown = Shutdown::new();
    let mut sup = Supervisor::new(shutdown.clone());

    let blocked_shutdown = shutdown.clone();
    sup.spawn("blocked", async move {
      blocked_shutdown.triggered().await;
      Ok(())
    });
    sup.spawn("failing", async { Err(anyhow::anyhow!("boom")) });

    let err = sup.run().await.expect_err("supervisor should surface the failure");
    assert!(format!("{err:#}").contains("boom"));
    assert!(shutdown.is_cancelled());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn clean_workers_produce_clean_exit() {
    let shutdown = Shutdown::new();
    let mut sup = Supervisor::new(shutdown.clone());
    sup.spawn("quick", async { Ok(()) });
    assert!(sup.run().await.is_ok());
  }
}
