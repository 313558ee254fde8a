//! Shared helpers for integration and module tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpListener;

/// Poll `f` until it returns true or `timeout` elapses.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut f: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if f().await {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(interval).await;
  }
}

/// Reserve an ephemeral TCP port on loopback. The listener is dropped, so
/// the port is free (racy in theory, reliable in tests on loopback).
pub async fn free_port() -> u16 {
  let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind ephemeral port");
  let port = listener.local_addr().expect("local addr").port();
  drop(listener);
  port
}

/// Echo server bound to a Unix socket; every accepted connection gets its
/// bytes written straight back until EOF.
#[cfg(unix)]
pub struct UnixEchoServer {
  task: tokio::task::JoinHandle<()>,
}

#[cfg(unix)]
impl UnixEchoServer {
  pub async fn bind(path: &Path) -> Self {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::UnixListener::bind(path).expect("bind echo socket");
    let task = tokio::spawn(async move {
      loop {
        let Ok((mut stream, _addr)) = listener.accept().await else {
          break;
        };
        tokio::spawn(async move {
          let mut buf = vec![0u8; 4096];
          loop {
            match stream.read(&mut buf).await {
              Ok(0) | Err(_) => break,
              Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                  break;
                }
              }
            }
          }
          let _ = stream.shutdown().await;
        });
      }
    });
    Self { task }
  }

  pub async fn stop(self) {
    self.task.abort();
    let _ = self.task.await;
  }
}

/// Generate an ed25519 identity under `dir` and write it the way the relay
/// expects: OpenSSH private key at `<name>` plus the single-line public key
/// at `<name>.pub`. Returns the identity path.
pub fn write_test_identity(dir: &Path, name: &str) -> PathBuf {
  use russh::keys::ssh_key::{self, LineEnding};

  let key = russh::keys::PrivateKey::random(&mut ssh_key::rand_core::OsRng, ssh_key::Algorithm::Ed25519)
    .expect("generate test key");
  let identity_path = dir.join(name);
  let pem = key.to_openssh(LineEnding::LF).expect("serialize test key");
  std::fs::write(&identity_path, pem.as_bytes()).expect("write test key");
  let public = key.public_key().to_openssh().expect("serialize public key");
  std::fs::write(dir.join(format!("{name}.pub")), format!("{public}\n")).expect("write public key");
  identity_path
}
