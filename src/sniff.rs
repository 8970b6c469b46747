//! Protocol detection for freshly accepted connections

use crate::conn::Rewind;
use crate::error::{Error, Result};
use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Bytes read before a connection is classified
pub const SNIFF_LEN: usize = 3;

const KEEPALIVE_TIME: Duration = Duration::from_secs(3 * 60);

/// Protocol family of an inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  /// SOCKS version 4 or 4a
  Socks4,
  /// SOCKS version 5
  Socks5,
  /// Plain HTTP, CONNECT or a WebSocket upgrade
  Http,
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Protocol::Socks4 => "socks4",
      Protocol::Socks5 => "socks5",
      Protocol::Http => "http",
    };
    f.write_str(name)
  }
}

/// Classify the first bytes of a connection.
///
/// Any `05 01` pair marks SOCKS5, then any `04 01` pair marks SOCKS4.
/// Everything else is left to the HTTP handler.
pub fn classify(prefix: &[u8]) -> Protocol {
  let contains = |pair: [u8; 2]| prefix.windows(2).any(|w| w == pair);
  if contains([5, 1]) {
    Protocol::Socks5
  } else if contains([4, 1]) {
    Protocol::Socks4
  } else {
    Protocol::Http
  }
}

/// Enable TCP keep-alive on an accepted socket
pub fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
  let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
  SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Read the classification prefix under `deadline`.
///
/// Returns `Ok(None)` when the peer closes before sending anything; the
/// caller drops such connections without logging an error. The bytes read
/// stay available through the returned [`Rewind`].
pub async fn sniff(
  mut stream: TcpStream,
  deadline: Duration,
) -> Result<Option<(Protocol, Rewind<TcpStream>)>> {
  let mut prefix = [0u8; SNIFF_LEN];
  let read = tokio::time::timeout(deadline, stream.read_exact(&mut prefix)).await;
  match read {
    Err(_) => Err(Error::connection_error("Timed out waiting for protocol bytes")),
    Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
    Ok(Err(e)) => Err(e.into()),
    Ok(Ok(_)) => {
      let protocol = classify(&prefix);
      tracing::debug!("Sniffed {} from {:02x?}", protocol, prefix);
      Ok(Some((
        protocol,
        Rewind::new(Bytes::copy_from_slice(&prefix), stream),
      )))
    }
  }
}
