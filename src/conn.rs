//! Client connection wrappers
//!
//! Protocol detection reads a few bytes before any handler runs, and the
//! HTTP handler buffers ahead of what it parses. [`Rewind`] hands those
//! bytes back so the next layer (TLS, a tunnel, a SOCKS parser) sees the
//! stream from where the previous one stopped.

use bytes::{Buf, Bytes};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};

/// Anything a session can be served over
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Type-erased client stream, plaintext or TLS
pub type BoxedIo = Box<dyn Io>;

/// Stream that yields `prefix` before reading from `inner`
#[derive(Debug)]
pub struct Rewind<S> {
  prefix: Option<Bytes>,
  inner: S,
}

impl<S> Rewind<S> {
  /// Wrap `inner`, replaying `prefix` first
  pub fn new(prefix: Bytes, inner: S) -> Self {
    let prefix = if prefix.is_empty() { None } else { Some(prefix) };
    Self { prefix, inner }
  }

  /// Wrap `inner` without replay
  pub fn plain(inner: S) -> Self {
    Self {
      prefix: None,
      inner,
    }
  }

  /// Bytes still waiting to be replayed
  pub fn prefix(&self) -> &[u8] {
    self.prefix.as_deref().unwrap_or_default()
  }

  /// Reference to the wrapped stream
  pub fn get_ref(&self) -> &S {
    &self.inner
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    if let Some(mut prefix) = self.prefix.take() {
      if !prefix.is_empty() {
        let n = prefix.len().min(buf.remaining());
        buf.put_slice(&prefix[..n]);
        prefix.advance(n);
        if !prefix.is_empty() {
          self.prefix = Some(prefix);
        }
        return Poll::Ready(Ok(()));
      }
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }

  fn poll_write_vectored(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    bufs: &[io::IoSlice<'_>],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
  }

  fn is_write_vectored(&self) -> bool {
    self.inner.is_write_vectored()
  }
}

/// Accepted client connection with a read buffer in front of it
pub struct ClientConn {
  /// Buffered reader; writes go through `get_mut()`
  pub reader: BufReader<BoxedIo>,
  /// Address of the client
  pub peer_addr: SocketAddr,
  /// Address the listener accepted on
  pub local_addr: SocketAddr,
  /// Set once the stream has been TLS-terminated
  pub tls: Option<crate::tls::TlsInfo>,
}

impl ClientConn {
  /// Wrap a freshly accepted or freshly decrypted stream
  pub fn new<S: Io + 'static>(io: S, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
    Self {
      reader: BufReader::new(Box::new(io)),
      peer_addr,
      local_addr,
      tls: None,
    }
  }

  /// Mark the connection as TLS-terminated
  pub fn with_tls(mut self, tls: crate::tls::TlsInfo) -> Self {
    self.tls = Some(tls);
    self
  }

  /// Mutable access to the raw stream for writing
  pub fn writer(&mut self) -> &mut BoxedIo {
    self.reader.get_mut()
  }

  /// Give up the read buffer, keeping whatever it already holds
  pub fn into_io(self) -> Rewind<BoxedIo> {
    let buffered = Bytes::copy_from_slice(self.reader.buffer());
    Rewind::new(buffered, self.reader.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn test_rewind_replays_prefix() {
    let inner: &[u8] = b" world";
    let mut stream = Rewind::new(Bytes::from_static(b"hello"), inner);
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "hello world");
  }

  #[tokio::test]
  async fn test_rewind_prefix_larger_than_buffer() {
    let inner: &[u8] = b"";
    let mut stream = Rewind::new(Bytes::from_static(b"abcdef"), inner);
    let mut first = [0u8; 4];
    stream.read_exact(&mut first).await.unwrap();
    assert_eq!(&first, b"abcd");
    assert_eq!(stream.prefix(), b"ef");
  }

  #[tokio::test]
  async fn test_into_io_keeps_buffered_bytes() {
    let (client, mut server) = tokio::io::duplex(64);
    server.write_all(b"line\r\nrest").await.unwrap();
    drop(server);
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let mut conn = ClientConn::new(client, addr, addr);
    let mut line = String::new();
    conn.reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "line\r\n");
    let mut io = conn.into_io();
    let mut rest = String::new();
    io.read_to_string(&mut rest).await.unwrap();
    assert_eq!(rest, "rest");
  }
}
