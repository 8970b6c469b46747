//! Accept loop helpers shared by the proxy and the certificate endpoint

use crate::error::{Error, Result};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Delay between failed accepts: doubles from 5ms up to 1s
#[derive(Debug, Default)]
pub(crate) struct Backoff {
  current: Option<Duration>,
}

impl Backoff {
  fn next(&mut self) -> Duration {
    let delay = match self.current {
      None => MIN_BACKOFF,
      Some(delay) => (delay * 2).min(MAX_BACKOFF),
    };
    self.current = Some(delay);
    delay
  }

  fn reset(&mut self) {
    self.current = None;
  }
}

/// Accept errors worth retrying
fn is_transient(err: &io::Error) -> bool {
  matches!(
    err.kind(),
    io::ErrorKind::ConnectionAborted
      | io::ErrorKind::ConnectionReset
      | io::ErrorKind::ConnectionRefused
      | io::ErrorKind::Interrupted
      | io::ErrorKind::WouldBlock
      | io::ErrorKind::TimedOut
  ) || matches!(err.raw_os_error(), Some(23 | 24))
}

/// Accept the next connection, sleeping through transient failures.
///
/// Only errors that leave the listener unusable are returned.
pub(crate) async fn accept(
  listener: &TcpListener,
  backoff: &mut Backoff,
) -> Result<(TcpStream, SocketAddr)> {
  loop {
    match listener.accept().await {
      Ok(accepted) => {
        backoff.reset();
        return Ok(accepted);
      }
      Err(e) if is_transient(&e) => {
        let delay = backoff.next();
        tracing::warn!("Accept failed: {}; retrying in {:?}", e, delay);
        tokio::time::sleep(delay).await;
      }
      Err(e) => {
        return Err(Error::proxy_error(format!("Listener stopped: {}", e)));
      }
    }
  }
}
