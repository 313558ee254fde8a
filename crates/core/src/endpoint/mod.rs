use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(unix)]
use tracing::debug;

use crate::config::PipePermissions;

#[cfg(windows)]
mod pipe;
#[cfg(windows)]
pub use pipe::PipeListener;

#[derive(Debug, Error)]
pub enum EndpointError {
  #[error("URI scheme not supported: {uri}")]
  UnsupportedScheme { uri: String },
  #[error("invalid TCP address: {address}")]
  InvalidTcpAddress { address: String },
}

/// A local endpoint that can be listened on or dialed. Named pipes are
/// listen-only on the platform that owns them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
  Unix(PathBuf),
  NamedPipe { path: String, permissions: PipePermissions },
  Tcp { host: String, port: u16 },
}

impl Endpoint {
  /// Resolve an endpoint string by scheme: `unix://<path>`,
  /// `npipe://<pipe>`, plain `host:port`, or empty for "tunnel only, no
  /// accept" (`None`).
  pub fn parse(uri: &str, permissions: PipePermissions) -> Result<Option<Endpoint>, EndpointError> {
    if uri.is_empty() {
      return Ok(None);
    }

    if let Some(path) = uri.strip_prefix("unix://") {
      #[cfg(windows)]
      let path = path.strip_prefix('/').unwrap_or(path);
      return Ok(Some(Endpoint::Unix(PathBuf::from(path))));
    }

    if let Some(path) = uri.strip_prefix("npipe://") {
      return Ok(Some(Endpoint::NamedPipe { path: path.replace('/', "\\"), permissions }));
    }

    if uri.contains("://") {
      return Err(EndpointError::UnsupportedScheme { uri: uri.to_string() });
    }

    let (host, port) = uri
      .rsplit_once(':')
      .ok_or_else(|| EndpointError::InvalidTcpAddress { address: uri.to_string() })?;
    let port: u16 = port
      .parse()
      .map_err(|_| EndpointError::InvalidTcpAddress { address: uri.to_string() })?;
    Ok(Some(Endpoint::Tcp { host: host.to_string(), port }))
  }

  /// Bind a listener on this endpoint.
  ///
  /// Unix sockets remove any stale socket file first and bind with a
  /// restrictive umask so the socket is only reachable by the owner.
  pub async fn bind(&self) -> io::Result<Listener> {
    match self {
      #[cfg(unix)]
      Endpoint::Unix(path) => {
        match std::fs::remove_file(path) {
          Ok(()) => debug!(path = %path.display(), "removed stale socket"),
          Err(err) if err.kind() == io::ErrorKind::NotFound => {}
          Err(err) => return Err(err),
        }
        let previous = nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(0o177));
        let bound = UnixListener::bind(path);
        nix::sys::stat::umask(previous);
        Ok(Listener::Unix(bound?))
      }
      #[cfg(not(unix))]
      Endpoint::Unix(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "unix sockets are not supported here")),
      Endpoint::Tcp { host, port } => Ok(Listener::Tcp(TcpListener::bind((host.as_str(), *port)).await?)),
      #[cfg(windows)]
      Endpoint::NamedPipe { path, permissions } => Ok(Listener::Pipe(PipeListener::bind(path, *permissions)?)),
      #[cfg(not(windows))]
      Endpoint::NamedPipe { .. } => {
        Err(io::Error::new(io::ErrorKind::Unsupported, "named pipes are not supported here"))
      }
    }
  }

  /// Dial this endpoint once.
  pub async fn dial(&self) -> io::Result<RelayStream> {
    match self {
      #[cfg(unix)]
      Endpoint::Unix(path) => Ok(RelayStream::Unix(UnixStream::connect(path).await?)),
      #[cfg(not(unix))]
      Endpoint::Unix(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "unix sockets are not supported here")),
      Endpoint::Tcp { host, port } => Ok(RelayStream::Tcp(TcpStream::connect((host.as_str(), *port)).await?)),
      #[cfg(windows)]
      Endpoint::NamedPipe { path, .. } => Ok(RelayStream::PipeClient(pipe::dial(path).await?)),
      #[cfg(not(windows))]
      Endpoint::NamedPipe { .. } => {
        Err(io::Error::new(io::ErrorKind::Unsupported, "named pipes are not supported here"))
      }
    }
  }
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
      Endpoint::NamedPipe { path, .. } => write!(f, "npipe:{path}"),
      Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
    }
  }
}

/// A bound listener for any endpoint kind.
pub enum Listener {
  #[cfg(unix)]
  Unix(UnixListener),
  Tcp(TcpListener),
  #[cfg(windows)]
  Pipe(PipeListener),
}

impl Listener {
  pub async fn accept(&mut self) -> io::Result<RelayStream> {
    match self {
      #[cfg(unix)]
      Listener::Unix(listener) => {
        let (stream, _addr) = listener.accept().await?;
        Ok(RelayStream::Unix(stream))
      }
      Listener::Tcp(listener) => {
        let (stream, _addr) = listener.accept().await?;
        Ok(RelayStream::Tcp(stream))
      }
      #[cfg(windows)]
      Listener::Pipe(listener) => Ok(RelayStream::Pipe(listener.accept().await?)),
    }
  }
}

/// An accepted or dialed connection with a uniform stream interface.
pub enum RelayStream {
  #[cfg(unix)]
  Unix(UnixStream),
  Tcp(TcpStream),
  #[cfg(windows)]
  Pipe(pipe::PipeStream),
  #[cfg(windows)]
  PipeClient(tokio::net::windows::named_pipe::NamedPipeClient),
}

impl AsyncRead for RelayStream {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      #[cfg(unix)]
      RelayStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
      RelayStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
      #[cfg(windows)]
      RelayStream::Pipe(s) => Pin::new(s).poll_read(cx, buf),
      #[cfg(windows)]
      RelayStream::PipeClient(s) => Pin::new(s).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for RelayStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    match self.get_mut() {
      #[cfg(unix)]
      RelayStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
      RelayStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
      #[cfg(windows)]
      RelayStream::Pipe(s) => Pin::new(s).poll_write(cx, buf),
      #[cfg(windows)]
      RelayStream::PipeClient(s) => Pin::new(s).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      #[cfg(unix)]
      RelayStream::Unix(s) => Pin::new(s).poll_flush(cx),
      RelayStream::Tcp(s) => Pin::new(s).poll_flush(cx),
      #[cfg(windows)]
      RelayStream::Pipe(s) => Pin::new(s).poll_flush(cx),
      #[cfg(windows)]
      RelayStream::PipeClient(s) => Pin::new(s).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      #[cfg(unix)]
      RelayStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
      RelayStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
      #[cfg(windows)]
      RelayStream::Pipe(s) => Pin::new(s).poll_shutdown(cx),
      #[cfg(windows)]
      RelayStream::PipeClient(s) => Pin::new(s).poll_shutdown(cx),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_uri_means_tunnel_only() {
    assert_eq!(Endpoint::parse("", PipePermissions::default()).unwrap(), None);
  }

  #[test]
  fn unix_uri_keeps_the_absolute_path() {
    let ep = Endpoint::parse("unix:///var/run/docker.sock", PipePermissions::default()).unwrap().unwrap();
    assert_eq!(ep, Endpoint::Unix(PathBuf::from("/var/run/docker.sock")));
  }

  #[test]
  fn npipe_uri_converts_to_backslashes() {
    let ep = Endpoint::parse("npipe:////./pipe/sockbridge", PipePermissions::AllowEveryone).unwrap().unwrap();
    assert_eq!(
      ep,
      Endpoint::NamedPipe {
        path: "\\\\.\\pipe\\sockbridge".to_string(),
        permissions: PipePermissions::AllowEveryone
      }
    );
  }

  #[test]
  fn bare_host_port_is_tcp() {
    let ep = Endpoint::parse("127.0.0.1:8080", PipePermissions::default()).unwrap().unwrap();
    assert_eq!(ep, Endpoint::Tcp { host: "127.0.0.1".to_string(), port: 8080 });
  }

  #[test]
  fn unknown_schemes_and_bad_addresses_are_rejected() {
    assert!(matches!(
      Endpoint::parse("ftp://example", PipePermissions::default()),
      Err(EndpointError::UnsupportedScheme { .. })
    ));
    assert!(matches!(
      Endpoint::parse("no-port-here", PipePermissions::default()),
      Err(EndpointError::InvalidTcpAddress { .. })
    ));
    assert!(matches!(
      Endpoint::parse("localhost:notaport", PipePermissions::default()),
      Err(EndpointError::InvalidTcpAddress { .. })
    ));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn unix_bind_replaces_a_stale_socket() {
    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("relay.sock");

    let ep = Endpoint::Unix(path.clone());
    let first = ep.bind().await.unwrap();
    drop(first);
    // The socket file is left behind; a rebind must remove it.
    assert!(path.exists());
    let _second = ep.bind().await.unwrap();
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn unix_dial_reaches_a_bound_listener() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("relay.sock");
    let ep = Endpoint::Unix(path.clone());

    let mut listener = ep.bind().await.unwrap();
    let server = tokio::spawn(async move {
      let mut stream = listener.accept().await.unwrap();
      let mut buf = [0u8; 4];
      stream.read_exact(&mut buf).await.unwrap();
      stream.write_all(&buf).await.unwrap();
    });

    let mut client = ep.dial().await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    server.await.unwrap();
  }
}
