use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, body::Incoming as IncomingBody, server::conn::http1};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::supervisor::Shutdown;

/// Snapshot served on `GET /metrics`. Durations are nanoseconds.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
  pub total_connections: u64,
  pub active_connections: u64,
  pub total_bytes_read: u64,
  pub total_bytes_written: u64,
  pub total_errors: u64,
  pub connection_errors: u64,
  pub socket_errors: u64,
  pub average_connection_duration: u64,
  pub uptime: u64,
}

/// Throughput and error-class counters, all atomically updated.
pub struct MetricsCollector {
  started_at: Instant,
  total_connections: AtomicU64,
  active_connections: AtomicU64,
  total_bytes_read: AtomicU64,
  total_bytes_written: AtomicU64,
  total_errors: AtomicU64,
  connection_errors: AtomicU64,
  socket_errors: AtomicU64,
  total_connection_duration: AtomicU64,
}

impl MetricsCollector {
  pub fn new() -> Self {
    Self {
      started_at: Instant::now(),
      total_connections: AtomicU64::new(0),
      active_connections: AtomicU64::new(0),
      total_bytes_read: AtomicU64::new(0),
      total_bytes_written: AtomicU64::new(0),
      total_errors: AtomicU64::new(0),
      connection_errors: AtomicU64::new(0),
      socket_errors: AtomicU64::new(0),
      total_connection_duration: AtomicU64::new(0),
    }
  }

  pub fn record_connection(&self) {
    self.total_connections.fetch_add(1, Ordering::Relaxed);
    self.active_connections.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_disconnection(&self, duration: Duration) {
    let _ = self
      .active_connections
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    self
      .total_connection_duration
      .fetch_add(duration.as_nanos().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
  }

  pub fn record_bytes_read(&self, bytes: u64) {
    self.total_bytes_read.fetch_add(bytes, Ordering::Relaxed);
  }

  pub fn record_bytes_written(&self, bytes: u64) {
    self.total_bytes_written.fetch_add(bytes, Ordering::Relaxed);
  }

  pub fn record_error(&self) {
    self.total_errors.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_connection_error(&self) {
    self.connection_errors.fetch_add(1, Ordering::Relaxed);
    self.record_error();
  }

  pub fn record_socket_error(&self) {
    self.socket_errors.fetch_add(1, Ordering::Relaxed);
    self.record_error();
  }

  pub fn snapshot(&self) -> Metrics {
    let total = self.total_connections.load(Ordering::Relaxed);
    let total_duration = self.total_connection_duration.load(Ordering::Relaxed);
    let average = if total > 0 { total_duration / total } else { 0 };

    Metrics {
      total_connections: total,
      active_connections: self.active_connections.load(Ordering::Relaxed),
      total_bytes_read: self.total_bytes_read.load(Ordering::Relaxed),
      total_bytes_written: self.total_bytes_written.load(Ordering::Relaxed),
      total_errors: self.total_errors.load(Ordering::Relaxed),
      connection_errors: self.connection_errors.load(Ordering::Relaxed),
      socket_errors: self.socket_errors.load(Ordering::Relaxed),
      average_connection_duration: average,
      uptime: self.started_at.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64,
    }
  }
}

impl Default for MetricsCollector {
  fn default() -> Self {
    Self::new()
  }
}

/// Serve `GET /metrics` until shutdown.
pub async fn serve(port: u16, collector: Arc<MetricsCollector>, shutdown: Shutdown) -> anyhow::Result<()> {
  let listener = TcpListener::bind(("0.0.0.0", port))
    .await
    .with_context(|| format!("unable to bind metrics listener on port {port}"))?;
  info!(event = "metrics_server_started", port, "metrics server started");

  loop {
    tokio::select! {
      _ = shutdown.triggered() => break,
      res = listener.accept() => {
        let (stream, _addr) = match res {
          Ok(accepted) => accepted,
          Err(err) => {
            error!(error = %err, "metrics listener accept error");
            continue;
          }
        };
        let collector = Arc::clone(&collector);
        tokio::spawn(async move {
          let service = service_fn(move |req| handle_request(req, Arc::clone(&collector)));
          if let Err(err) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
            debug!(error = %err, "metrics connection error");
          }
        });
      }
    }
  }

  info!(event = "metrics_server_stopped", port, "metrics server stopped");
  Ok(())
}

async fn handle_request(
  req: Request<IncomingBody>,
  collector: Arc<MetricsCollector>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
  match req.uri().path() {
    "/metrics" => {
      let body = serde_json::to_vec(&collector.snapshot()).unwrap_or_else(|_| b"{}".to_vec());
      Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::from(Bytes::from(body)))
    }
    _ => Response::builder().status(StatusCode::NOT_FOUND).body(Full::from(Bytes::new())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn connection_counters_are_monotonic_totals() {
    let collector = MetricsCollector::new();
    collector.record_connection();
    collector.record_connection();
    collector.record_disconnection(Duration::from_millis(10));

    let m = collector.snapshot();
    assert_eq!(m.total_connections, 2);
    assert_eq!(m.active_connections, 1);
    assert!(m.total_connections >= m.active_connections);
  }

  #[test]
  fn active_connections_saturate_at_zero() {
    let collector = MetricsCollector::new();
    collector.record_disconnection(Duration::from_millis(1));
    assert_eq!(collector.snapshot().active_connections, 0);
  }

  #[test]
  fn byte_counters_accumulate() {
    let collector = MetricsCollector::new();
    collector.record_bytes_read(100);
    collector.record_bytes_read(50);
    collector.record_bytes_written(25);

    let m = collector.snapshot();
    assert_eq!(m.total_bytes_read, 150);
    assert_eq!(m.total_bytes_written, 25);
  }

  #[test]
  fn error_classes_roll_up_into_the_total() {
    let collector = MetricsCollector::new();
    collector.record_connection_error();
    collector.record_socket_error();
    collector.record_error();

    let m = collector.snapshot();
    assert_eq!(m.connection_errors, 1);
    assert_eq!(m.socket_errors, 1);
    assert_eq!(m.total_errors, 3);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn endpoint_serves_the_snapshot() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let collector = Arc::new(MetricsCollector::new());
    collector.record_bytes_read(42);

    let port = test_support::free_port().await;
    let shutdown = Shutdown::new();
    let server = tokio::spawn(serve(port, Arc::clone(&collector), shutdown.clone()));

    let up = test_support::poll_until(
      std::time::Duration::from_secs(2),
      std::time::Duration::from_millis(25),
      || async { tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() },
    )
    .await;
    assert!(up, "metrics server did not come up");

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
      .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
      .await
      .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    assert!(response.contains("\"total_bytes_read\":42"));

    shutdown.cancel();
    server.await.unwrap().unwrap();
  }

  #[test]
  fn average_duration_is_total_over_connections() {
    let collector = MetricsCollector::new();
    assert_eq!(collector.snapshot().average_connection_duration, 0);

    collector.record_connection();
    collector.record_connection();
    collector.record_disconnection(Duration::from_nanos(100));
    collector.record_disconnection(Duration::from_nanos(300));

    assert_eq!(collector.snapshot().average_connection_duration, 200);
  }
}
