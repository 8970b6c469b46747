//! SOCKS4 and SOCKS4a server side

use super::wire::{Command, Socks4Request, Socks4Response, TargetAddr};
use super::{accept_bound, bind_listener, dial};
use crate::conn::ClientConn;
use crate::error::{Error, Result};
use crate::handler::{Handler, ProxyContext};
use crate::session::{SchemeType, Session};
use crate::tunnel::relay;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Serves one SOCKS4 client
pub struct Socks4Handler {
  ctx: Arc<ProxyContext>,
  session: Session,
}

fn v4_or_unspecified(addr: SocketAddr) -> SocketAddrV4 {
  match addr {
    SocketAddr::V4(addr) => addr,
    SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port()),
  }
}

impl Socks4Handler {
  pub fn new(ctx: Arc<ProxyContext>, mut session: Session) -> Self {
    session.set_scheme(SchemeType::Socks4);
    Self { ctx, session }
  }

  async fn reply(conn: &mut ClientConn, response: Socks4Response) -> Result<()> {
    conn.writer().write_all(&response.to_bytes()).await?;
    conn.writer().flush().await?;
    Ok(())
  }

  async fn connect(&mut self, mut conn: ClientConn, target: TargetAddr) -> Result<()> {
    let origin = match dial(&self.ctx, &target).await {
      Ok(origin) => origin,
      Err(e) => {
        Self::reply(&mut conn, Socks4Response::rejected()).await?;
        return Err(Error::connection_error(format!(
          "Failed to connect to {}: {}",
          target, e
        )));
      }
    };
    Self::reply(&mut conn, Socks4Response::granted(v4_or_unspecified(origin.local_addr()?))).await?;
    self.session.reset_clock();
    relay(&mut self.session, conn.into_io(), origin).await
  }

  async fn bind(&mut self, mut conn: ClientConn, target: TargetAddr) -> Result<()> {
    let listener = match bind_listener(conn.local_addr.ip()).await {
      Ok(listener) => listener,
      Err(e) => {
        Self::reply(&mut conn, Socks4Response::rejected()).await?;
        return Err(e.into());
      }
    };
    let bound = listener.local_addr()?;
    Self::reply(&mut conn, Socks4Response::granted(v4_or_unspecified(bound))).await?;
    tracing::debug!("[{}] SOCKS4 BIND listening on {}", self.session.id, bound);
    let (peer, peer_addr) =
      match accept_bound(listener, &target, self.ctx.config.dial_timeout).await {
        Ok(accepted) => accepted,
        Err(e) => {
          Self::reply(&mut conn, Socks4Response::rejected()).await?;
          return Err(e);
        }
      };
    Self::reply(&mut conn, Socks4Response::granted(v4_or_unspecified(peer_addr))).await?;
    self.session.reset_clock();
    relay(&mut self.session, conn.into_io(), peer).await
  }
}

#[async_trait]
impl Handler for Socks4Handler {
  fn scheme(&self) -> SchemeType {
    SchemeType::Socks4
  }

  async fn serve(&mut self, mut conn: ClientConn) -> Result<()> {
    let request = Socks4Request::read_from(&mut conn.reader).await?;
    self.session.packet.edit.host = request.addr.to_string();
    self.session.packet.edit.method = format!("{:?}", request.command).to_uppercase();
    if !request.user_id.is_empty() {
      self.session.packet.edit.note = format!("user id {}", request.user_id);
    }
    tracing::debug!(
      "[{}] SOCKS4 {:?} {}",
      self.session.id,
      request.command,
      request.addr
    );
    match request.command {
      Command::Connect => self.connect(conn, request.addr).await,
      Command::Bind => self.bind(conn, request.addr).await,
      Command::Associate | Command::Unknown(_) => {
        Self::reply(&mut conn, Socks4Response::rejected()).await?;
        Err(Error::proxy_error(format!(
          "SOCKS4 command {:?} not supported",
          request.command
        )))
      }
    }
  }
}
