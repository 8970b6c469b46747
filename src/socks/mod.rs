//! SOCKS4/4a and SOCKS5 front ends
//!
//! Both handlers negotiate, open the requested connection and hand both
//! streams to [`crate::tunnel::relay`].

mod socks4;
mod socks5;
pub mod wire;

pub use socks4::Socks4Handler;
pub use socks5::Socks5Handler;
pub use wire::TargetAddr;

use crate::error::{Error, ReplyError, Result};
use crate::handler::ProxyContext;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Checks RFC 1929 username/password credentials
pub trait Authenticator: Send + Sync {
  fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// A single fixed username and password
#[derive(Debug, Clone)]
pub struct StaticCredentials {
  username: String,
  password: String,
}

impl StaticCredentials {
  pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
    Self {
      username: username.into(),
      password: password.into(),
    }
  }
}

impl Authenticator for StaticCredentials {
  fn authenticate(&self, username: &str, password: &str) -> bool {
    self.username == username && self.password == password
  }
}

/// Dial the CONNECT target
async fn dial(ctx: &ProxyContext, target: &TargetAddr) -> io::Result<TcpStream> {
  match target {
    TargetAddr::Ip(addr) => ctx.connector.connect_with_addr(*addr).await,
    TargetAddr::Domain(domain, port) => ctx.connector.connect(domain, *port).await,
  }
}

/// Listener for a BIND request, on the address the client reached us at
async fn bind_listener(local_ip: IpAddr) -> io::Result<TcpListener> {
  TcpListener::bind(SocketAddr::new(local_ip, 0)).await
}

/// Wait for the one inbound connection a BIND request announces.
///
/// The peer must come from the address named in the request.
async fn accept_bound(
  listener: TcpListener,
  expected: &TargetAddr,
  deadline: Duration,
) -> Result<(TcpStream, SocketAddr)> {
  let (stream, peer) = match tokio::time::timeout(deadline, listener.accept()).await {
    Ok(accepted) => accepted?,
    Err(_) => {
      tracing::debug!("No connection to BIND listener within {:?}", deadline);
      return Err(ReplyError::TtlExpired.into());
    }
  };
  drop(listener);
  let expected_ip = expected.resolve().await?.ip();
  if expected_ip != peer.ip() {
    tracing::warn!("BIND peer {} does not match requested {}", peer, expected);
    return Err(ReplyError::ConnectionNotAllowed.into());
  }
  Ok((stream, peer))
}

/// Reply code for a failed CONNECT or BIND step
fn reply_for(err: &Error) -> ReplyError {
  match err {
    Error::Reply(reply) => *reply,
    Error::Io(e) => ReplyError::from_io(e),
    _ => ReplyError::GeneralFailure,
  }
}
