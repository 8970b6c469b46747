//! Origin connections for the HTTP and WebSocket handlers

use super::{HttpRequest, HttpResponse};
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use socket2::{Domain, Protocol, Socket as RawSocket, TcpKeepalive, Type};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Plain or TLS origin stream
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
  /// Underlying TCP stream
  pub fn tcp(&self) -> &TcpStream {
    match self {
      MaybeTlsStream::Tcp(s) => s,
      MaybeTlsStream::Tls(t) => t.get_ref().0,
    }
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

/// Dials origins with the proxy's timeouts and TLS trust settings
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Duration,
  handshake_timeout: Duration,
  tls: TlsConnector,
}

impl Connector {
  /// Build from the proxy configuration
  pub fn new(config: &ProxyConfig) -> Result<Self> {
    let tls = TlsConnector::from(crate::tls::client_config(config.verify_upstream)?);
    Ok(Self {
      connect_timeout: config.dial_timeout,
      handshake_timeout: config.handshake_timeout,
      tls,
    })
  }

  /// Connect to one resolved address
  pub async fn connect_with_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    raw_socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    socket.set_nodelay(true)?;
    tokio::time::timeout(self.connect_timeout, socket.connect(addr))
      .await
      .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr)))?
  }

  /// Resolve `host` and connect to the first address that answers
  pub async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut last_err = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => {
          tracing::debug!("Connect to {} failed: {}", addr, e);
          last_err = Some(e);
        }
      }
    }
    Err(last_err.unwrap_or_else(|| {
      io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} resolved to no addresses", host),
      )
    }))
  }

  /// Upgrade a TCP stream to TLS with SNI `host`
  pub async fn upgrade_to_tls(&self, stream: TcpStream, host: &str) -> Result<MaybeTlsStream> {
    let name = crate::tls::server_name(host)?;
    let handshake = self.tls.connect(name, stream);
    let tls = tokio::time::timeout(self.handshake_timeout, handshake)
      .await
      .map_err(|_| Error::tls_error(format!("TLS handshake with {} timed out", host)))?
      .map_err(|e| Error::tls_error(format!("TLS handshake with {} failed: {}", host, e)))?;
    Ok(MaybeTlsStream::Tls(Box::new(tls)))
  }

  /// Connect, adding TLS when `tls` is set
  pub async fn open(&self, host: &str, port: u16, tls: bool) -> Result<MaybeTlsStream> {
    let stream = self.connect(host, port).await?;
    if tls {
      self.upgrade_to_tls(stream, host).await
    } else {
      Ok(MaybeTlsStream::Tcp(stream))
    }
  }

  /// Send a normalised request to its origin and read the response.
  ///
  /// Every exchange uses a fresh connection that the origin is asked to
  /// close, so the body can always be read to completion.
  pub async fn round_trip(&self, request: &HttpRequest) -> Result<HttpResponse> {
    let https = request.uri.scheme() == Some(&http::uri::Scheme::HTTPS);
    let host = request.hostname();
    let port = request.port(if https { 443 } else { 80 });
    let mut stream = self.open(&host, port, https).await?;
    stream.write_all(&request.to_raw(true, true)).await?;
    stream.flush().await?;
    let mut reader = BufReader::new(stream);
    HttpResponse::read(&mut reader, &request.method).await
  }
}
