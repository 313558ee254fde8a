use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::supervisor::Shutdown;

/// Descriptor of one live tunnel. Identity is assigned by the caller and
/// unique per live tunnel.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
  pub id: String,
  pub socket_path: String,
  pub started_at: Instant,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcquireError {
  #[error("connection pool exhausted (max: {capacity})")]
  Exhausted { capacity: usize },
  #[error("acquire aborted: shutdown in progress")]
  Cancelled,
}

/// Bounded admission control for active tunnels.
///
/// Admission is non-blocking: a full pool reports [`AcquireError::Exhausted`]
/// immediately and the caller decides whether to retry. A cancelled shutdown
/// handle wins over an available permit.
pub struct ConnectionPool {
  capacity: usize,
  semaphore: Semaphore,
  connections: RwLock<HashMap<String, ConnectionInfo>>,
}

impl ConnectionPool {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      semaphore: Semaphore::new(capacity),
      connections: RwLock::new(HashMap::with_capacity(capacity)),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Try to admit the connection `id`. Never blocks.
  pub fn acquire(&self, shutdown: &Shutdown, id: &str, socket_path: &str) -> Result<(), AcquireError> {
    if shutdown.is_cancelled() {
      return Err(AcquireError::Cancelled);
    }

    match self.semaphore.try_acquire() {
      Ok(permit) => permit.forget(),
      Err(_) => return Err(AcquireError::Exhausted { capacity: self.capacity }),
    }

    let info = ConnectionInfo {
      id: id.to_string(),
      socket_path: socket_path.to_string(),
      started_at: Instant::now(),
    };
    self.connections.write().unwrap().insert(id.to_string(), info);

    debug!(
      event = "connection_acquired",
      id,
      active = self.active_count(),
      capacity = self.capacity,
      "connection acquired"
    );
    Ok(())
  }

  /// Return the permit held by `id`. Unknown ids are a logged no-op, so a
  /// double release can never block another acquire.
  pub fn release(&self, id: &str) {
    let removed = self.connections.write().unwrap().remove(id);
    if removed.is_none() {
      debug!(event = "connection_release_unknown", id, "attempted to release unknown connection");
      return;
    }

    self.semaphore.add_permits(1);
    debug!(
      event = "connection_released",
      id,
      active = self.active_count(),
      capacity = self.capacity,
      "connection released"
    );
  }

  pub fn active_count(&self) -> usize {
    self.connections.read().unwrap().len()
  }

  pub fn snapshot(&self) -> Vec<ConnectionInfo> {
    self.connections.read().unwrap().values().cloned().collect()
  }
}
