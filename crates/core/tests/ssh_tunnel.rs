//! End-to-end tunnel scenarios over a real SSH transport on loopback.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sockbridge_core::endpoint::Endpoint;
use sockbridge_core::forward::{Bastion, SshDestination, SshForward};
use sockbridge_core::health::HealthChecker;
use sockbridge_core::keys;
use sockbridge_core::metrics::MetricsCollector;
use sockbridge_core::pool::ConnectionPool;
use sockbridge_core::server::SshServer;
use sockbridge_core::supervisor::Shutdown;
use test_support::{UnixEchoServer, free_port, poll_until, write_test_identity};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

struct RunningServer {
  shutdown: Shutdown,
  task: JoinHandle<anyhow::Result<()>>,
}

async fn start_server(identity_path: &Path, port: u16) -> RunningServer {
  let identity = keys::load_identity(identity_path).expect("load identity");
  let shutdown = Shutdown::new();
  let server = SshServer::new(
    identity,
    8192,
    Arc::new(HealthChecker::new()),
    Arc::new(MetricsCollector::new()),
    shutdown.clone(),
  );
  let address = format!("127.0.0.1:{port}");
  let task = tokio::spawn(async move { server.serve(&address).await });

  let up = poll_until(Duration::from_secs(3), Duration::from_millis(25), || async {
    tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok()
  })
  .await;
  assert!(up, "SSH server did not come up on port {port}");

  RunningServer { shutdown, task }
}

impl RunningServer {
  async fn stop(self) {
    self.shutdown.cancel();
    let _ = self.task.await;
  }
}

async fn connect_bastion(identity_path: &Path, dir: &Path, port: u16, socket_path: &Path) -> Arc<Bastion> {
  let identity = keys::load_identity(identity_path).expect("load identity");
  let destination =
    SshDestination::parse(&format!("ssh://core@127.0.0.1:{port}{}", socket_path.display())).unwrap();
  let shutdown = Shutdown::new();
  Arc::new(
    Bastion::connect(
      destination,
      dir.join("known_hosts"),
      Duration::from_secs(5),
      5,
      identity.key.clone(),
      &shutdown,
    )
    .await
    .expect("bastion connect"),
  )
}

async fn start_forward(bastion: Arc<Bastion>, local_socket: &Path, shutdown: Shutdown) -> JoinHandle<anyhow::Result<()>> {
  let forward = SshForward::bind(
    Some(Endpoint::Unix(local_socket.to_path_buf())),
    bastion,
    Arc::new(ConnectionPool::new(100)),
    Arc::new(HealthChecker::new()),
    Arc::new(MetricsCollector::new()),
    8192,
    shutdown,
  )
  .await
  .expect("bind forward");
  tokio::spawn(forward.serve())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn basic_tunnel_round_trips_and_propagates_eof() {
  let td = tempfile::tempdir().unwrap();
  let identity_path = write_test_identity(td.path(), "id_test");

  let echo_path = td.path().join("echo.sock");
  let _echo = UnixEchoServer::bind(&echo_path).await;

  let port = free_port().await;
  let server = start_server(&identity_path, port).await;

  let bastion = connect_bastion(&identity_path, td.path(), port, &echo_path).await;
  let local_socket = td.path().join("local.sock");
  let forward_shutdown = Shutdown::new();
  let forward = start_forward(bastion, &local_socket, forward_shutdown.clone()).await;

  let mut client = UnixStream::connect(&local_socket).await.unwrap();
  client.write_all(b"PING\n").await.unwrap();
  let mut buf = [0u8; 5];
  client.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf, b"PING\n");

  // Half-close from the client propagates through the tunnel: the echo
  // server closes in turn and the client sees EOF, not a hang or a reset.
  client.shutdown().await.unwrap();
  let mut rest = Vec::new();
  let eof = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;
  assert!(eof.is_ok(), "client did not observe EOF after half-close");
  assert!(rest.is_empty());

  forward_shutdown.cancel();
  let _ = forward.await;
  server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn payloads_larger_than_the_buffer_survive_in_order() {
  let td = tempfile::tempdir().unwrap();
  let identity_path = write_test_identity(td.path(), "id_test");

  let echo_path = td.path().join("echo.sock");
  let _echo = UnixEchoServer::bind(&echo_path).await;

  let port = free_port().await;
  let server = start_server(&identity_path, port).await;
  let bastion = connect_bastion(&identity_path, td.path(), port, &echo_path).await;

  let local_socket = td.path().join("local.sock");
  let forward_shutdown = Shutdown::new();
  let forward = start_forward(bastion, &local_socket, forward_shutdown.clone()).await;

  let payload: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
  let mut client = UnixStream::connect(&local_socket).await.unwrap();
  let (mut read_half, mut write_half) = client.split();

  // Keep the write side open until the whole echo is back: the server-side
  // splice force-closes on EOF and would cut a reply still in flight.
  let expected = payload.clone();
  let writer = async move {
    write_half.write_all(&payload).await.unwrap();
  };
  let reader = async move {
    let mut received = vec![0u8; expected.len()];
    read_half.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected);
  };
  tokio::join!(writer, reader);
  drop(client);

  forward_shutdown.cancel();
  let _ = forward.await;
  server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_different_key_fails_authentication() {
  let td = tempfile::tempdir().unwrap();
  let server_identity = write_test_identity(td.path(), "id_server");
  let client_identity = write_test_identity(td.path(), "id_client");

  let port = free_port().await;
  let server = start_server(&server_identity, port).await;

  let identity = keys::load_identity(&client_identity).unwrap();
  let destination = SshDestination::parse(&format!("ssh://core@127.0.0.1:{port}/tmp/echo.sock")).unwrap();
  let shutdown = Shutdown::new();
  let result = Bastion::connect(
    destination,
    td.path().join("known_hosts"),
    Duration::from_secs(5),
    1,
    identity.key.clone(),
    &shutdown,
  )
  .await;

  let err = result.expect_err("a foreign key must be rejected");
  assert!(format!("{err:#}").contains("authentication"), "unexpected error: {err:#}");

  server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forward_survives_server_death_and_recovers() {
  let td = tempfile::tempdir().unwrap();
  let identity_path = write_test_identity(td.path(), "id_test");

  let echo_path = td.path().join("echo.sock");
  let _echo = UnixEchoServer::bind(&echo_path).await;

  let port = free_port().await;
  let server = start_server(&identity_path, port).await;
  let bastion = connect_bastion(&identity_path, td.path(), port, &echo_path).await;

  let local_socket = td.path().join("local.sock");
  let forward_shutdown = Shutdown::new();
  let forward = start_forward(bastion, &local_socket, forward_shutdown.clone()).await;

  // Sanity roundtrip through the first server.
  let mut client = UnixStream::connect(&local_socket).await.unwrap();
  client.write_all(b"one").await.unwrap();
  let mut buf = [0u8; 3];
  client.read_exact(&mut buf).await.unwrap();
  drop(client);

  // Kill the server. Inbound connections now fail (logged, dropped) but the
  // forward must keep accepting.
  server.stop().await;

  let mut orphan = UnixStream::connect(&local_socket).await.unwrap();
  let mut sink = Vec::new();
  // The tunnel cannot be established; the connection is dropped after the
  // retry ladder, surfacing as EOF on our side.
  let _ = tokio::time::timeout(Duration::from_secs(10), orphan.read_to_end(&mut sink)).await;
  assert!(!forward.is_finished(), "forward must not exit after a failed tunnel");

  // Restart the server on the same port; the bastion reconnects on demand.
  let server = start_server(&identity_path, port).await;

  let recovered = poll_until(Duration::from_secs(10), Duration::from_millis(100), || async {
    let Ok(mut client) = UnixStream::connect(&local_socket).await else {
      return false;
    };
    if client.write_all(b"two").await.is_err() {
      return false;
    }
    let mut buf = [0u8; 3];
    matches!(
      tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf)).await,
      Ok(Ok(_)) if &buf == b"two"
    )
  })
  .await;
  assert!(recovered, "tunnel did not recover after the server came back");

  forward_shutdown.cancel();
  let _ = forward.await;
  server.stop().await;
}
