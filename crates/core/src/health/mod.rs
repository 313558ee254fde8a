use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, body::Incoming as IncomingBody, server::conn::http1};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::supervisor::Shutdown;

/// Above this many active connections the relay reports itself degraded.
const DEGRADED_ACTIVE_CONNECTIONS: u64 = 1000;

/// Snapshot served on `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
  pub status: &'static str,
  pub uptime: String,
  pub active_connections: u64,
  pub total_connections: u64,
  pub error_count: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
  pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
  pub fn is_degraded(&self) -> bool {
    self.active_connections > DEGRADED_ACTIVE_CONNECTIONS
  }
}

/// Liveness counters. All counters are updated with atomic increments; the
/// last error string sits behind a short read/write lock.
pub struct HealthChecker {
  started_at: Instant,
  active_connections: AtomicU64,
  total_connections: AtomicU64,
  error_count: AtomicU64,
  last_error: RwLock<Option<String>>,
}

impl HealthChecker {
  pub fn new() -> Self {
    Self {
      started_at: Instant::now(),
      active_connections: AtomicU64::new(0),
      total_connections: AtomicU64::new(0),
      error_count: AtomicU64::new(0),
      last_error: RwLock::new(None),
    }
  }

  pub fn increment_connections(&self) {
    self.active_connections.fetch_add(1, Ordering::Relaxed);
    self.total_connections.fetch_add(1, Ordering::Relaxed);
  }

  /// Active connections can never go below zero, even on spurious calls.
  pub fn decrement_connections(&self) {
    let _ = self
      .active_connections
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
  }

  pub fn record_error(&self, err: &dyn std::fmt::Display) {
    self.error_count.fetch_add(1, Ordering::Relaxed);
    *self.last_error.write().unwrap() = Some(err.to_string());
  }

  pub fn status(&self) -> HealthStatus {
    let active = self.active_connections.load(Ordering::Relaxed);
    HealthStatus {
      status: if active > DEGRADED_ACTIVE_CONNECTIONS { "degraded" } else { "healthy" },
      uptime: format!("{:?}", self.started_at.elapsed()),
      active_connections: active,
      total_connections: self.total_connections.load(Ordering::Relaxed),
      error_count: self.error_count.load(Ordering::Relaxed),
      last_error: self.last_error.read().unwrap().clone(),
      timestamp: Utc::now(),
    }
  }
}

impl Default for HealthChecker {
  fn default() -> Self {
    Self::new()
  }
}

/// Serve `GET /health` and `GET /ready` until shutdown. A bind failure is
/// fatal for this worker.
pub async fn serve(port: u16, checker: Arc<HealthChecker>, shutdown: Shutdown) -> anyhow::Result<()> {
  let listener = TcpListener::bind(("0.0.0.0", port))
    .await
    .with_context(|| format!("unable to bind health check listener on port {port}"))?;
  info!(event = "health_server_started", port, "health check server started");

  loop {
    tokio::select! {
      _ = shutdown.triggered() => break,
      res = listener.accept() => {
        let (stream, _addr) = match res {
          Ok(accepted) => accepted,
          Err(err) => {
            error!(error = %err, "health listener accept error");
            continue;
          }
        };
        let checker = Arc::clone(&checker);
        tokio::spawn(async move {
          let service = service_fn(move |req| handle_request(req, Arc::clone(&checker)));
          if let Err(err) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
            debug!(error = %err, "health connection error");
          }
        });
      }
    }
  }

  info!(event = "health_server_stopped", port, "health check server stopped");
  Ok(())
}

async fn handle_request(
  req: Request<IncomingBody>,
  checker: Arc<HealthChecker>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
  match req.uri().path() {
    "/health" => {
      let status = checker.status();
      let code = if status.is_degraded() { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
      let body = serde_json::to_vec(&status).unwrap_or_else(|_| b"{}".to_vec());
      Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::from(Bytes::from(body)))
    }
    "/ready" => Response::builder().status(StatusCode::OK).body(Full::from(Bytes::from_static(b"ready"))),
    _ => Response::builder().status(StatusCode::NOT_FOUND).body(Full::from(Bytes::new())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn counters_track_connections() {
    let checker = HealthChecker::new();
    checker.increment_connections();
    checker.increment_connections();
    checker.decrement_connections();

    let status = checker.status();
    assert_eq!(status.status, "healthy");
    assert_eq!(status.active_connections, 1);
    assert_eq!(status.total_connections, 2);
    assert_eq!(status.error_count, 0);
    assert!(status.last_error.is_none());
  }

  #[test]
  fn active_connections_never_go_negative() {
    let checker = HealthChecker::new();
    checker.decrement_connections();
    checker.decrement_connections();
    assert_eq!(checker.status().active_connections, 0);

    checker.increment_connections();
    assert_eq!(checker.status().active_connections, 1);
    assert_eq!(checker.status().total_connections, 1);
  }

  #[test]
  fn errors_are_recorded_with_the_last_message() {
    let checker = HealthChecker::new();
    checker.record_error(&"dial failed");
    checker.record_error(&"handshake failed");

    let status = checker.status();
    assert_eq!(status.error_count, 2);
    assert_eq!(status.last_error.as_deref(), Some("handshake failed"));
  }

  #[test]
  fn degraded_exactly_above_threshold() {
    let checker = HealthChecker::new();
    for _ in 0..DEGRADED_ACTIVE_CONNECTIONS {
      checker.increment_connections();
    }
    let status = checker.status();
    assert_eq!(status.status, "healthy");
    assert!(!status.is_degraded());

    checker.increment_connections();
    let status = checker.status();
    assert_eq!(status.status, "degraded");
    assert!(status.is_degraded());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn endpoint_serves_health_and_ready() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let checker = Arc::new(HealthChecker::new());
    checker.increment_connections();

    let port = test_support::free_port().await;
    let shutdown = Shutdown::new();
    let server = tokio::spawn(serve(port, Arc::clone(&checker), shutdown.clone()));

    let up = test_support::poll_until(
      std::time::Duration::from_secs(2),
      std::time::Duration::from_millis(25),
      || async { tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() },
    )
    .await;
    assert!(up, "health server did not come up");

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
      .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
      .await
      .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    assert!(response.contains("\"status\":\"healthy\""));
    assert!(response.contains("\"active_connections\":1"));

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
      .write_all(b"GET /ready HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
      .await
      .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("ready"));

    shutdown.cancel();
    server.await.unwrap().unwrap();
  }

  #[test]
  fn status_serializes_without_null_last_error() {
    let checker = HealthChecker::new();
    let json = serde_json::to_value(checker.status()).unwrap();
    assert_eq!(json["status"], "healthy");
    assert!(json.get("last_error").is_none());
    assert!(json.get("uptime").is_some());
    assert!(json.get("timestamp").is_some());

    checker.record_error(&"boom");
    let json = serde_json::to_value(checker.status()).unwrap();
    assert_eq!(json["last_error"], "boom");
  }
}
