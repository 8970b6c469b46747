//! SOCKS5 server side with optional RFC 1929 authentication

use super::wire::{
  AuthMethod, Command, MethodSelectRequest, MethodSelectResponse, Socks5Request, Socks5Response,
  TargetAddr, UsernamePasswordAuthRequest, UsernamePasswordAuthResponse,
};
use super::{accept_bound, bind_listener, dial, reply_for, Authenticator, StaticCredentials};
use crate::conn::ClientConn;
use crate::error::{Error, ReplyError, Result};
use crate::handler::{Handler, ProxyContext};
use crate::session::{SchemeType, Session};
use crate::tunnel::relay;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;

/// Serves one SOCKS5 client
pub struct Socks5Handler {
  ctx: Arc<ProxyContext>,
  session: Session,
  authenticator: Option<Arc<dyn Authenticator>>,
  /// Method agreed on during negotiation
  method: AuthMethod,
}

impl Socks5Handler {
  /// Requires username/password when the proxy has SOCKS credentials set
  pub fn new(ctx: Arc<ProxyContext>, mut session: Session) -> Self {
    session.set_scheme(SchemeType::Socks5);
    let authenticator = ctx
      .config
      .socks_credentials
      .as_ref()
      .map(|(user, pass)| Arc::new(StaticCredentials::new(user, pass)) as Arc<dyn Authenticator>);
    Self {
      ctx,
      session,
      authenticator,
      method: AuthMethod::NoAcceptableMethods,
    }
  }

  /// Check credentials with `authenticator` instead
  pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
    self.authenticator = Some(authenticator);
    self
  }

  fn supported_methods(&self) -> &'static [AuthMethod] {
    if self.authenticator.is_some() {
      &[AuthMethod::UsernamePassword]
    } else {
      &[AuthMethod::NotRequired]
    }
  }

  /// First client-offered method the server supports
  fn select_method(&self, offered: &[AuthMethod]) -> AuthMethod {
    let supported = self.supported_methods();
    offered
      .iter()
      .copied()
      .find(|m| supported.contains(m))
      .unwrap_or(AuthMethod::NoAcceptableMethods)
  }

  async fn negotiate(&mut self, conn: &mut ClientConn) -> Result<()> {
    let request = MethodSelectRequest::read_from(&mut conn.reader).await?;
    self.method = self.select_method(&request.methods);
    let response = MethodSelectResponse {
      method: self.method,
    };
    conn.writer().write_all(&response.to_bytes()).await?;
    conn.writer().flush().await?;
    match self.method {
      AuthMethod::NotRequired => Ok(()),
      AuthMethod::UsernamePassword => self.authenticate(conn).await,
      _ => Err(Error::proxy_error(format!(
        "No acceptable authentication method among {:?}",
        request.methods
      ))),
    }
  }

  async fn authenticate(&mut self, conn: &mut ClientConn) -> Result<()> {
    let request = UsernamePasswordAuthRequest::read_from(&mut conn.reader).await?;
    let success = self
      .authenticator
      .as_ref()
      .is_some_and(|auth| auth.authenticate(&request.username, &request.password));
    let response = UsernamePasswordAuthResponse { success };
    conn.writer().write_all(&response.to_bytes()).await?;
    conn.writer().flush().await?;
    if !success {
      return Err(Error::proxy_error(format!(
        "Authentication with username `{}` rejected",
        request.username
      )));
    }
    self.session.packet.edit.note = format!("user {}", request.username);
    Ok(())
  }

  async fn reply(conn: &mut ClientConn, response: Socks5Response) -> Result<()> {
    conn.writer().write_all(&response.to_bytes()?).await?;
    conn.writer().flush().await?;
    Ok(())
  }

  async fn reject(conn: &mut ClientConn, err: Error) -> Result<()> {
    Self::reply(conn, Socks5Response::rejected(reply_for(&err))).await?;
    Err(err)
  }

  async fn connect(&mut self, mut conn: ClientConn, target: TargetAddr) -> Result<()> {
    let origin = match dial(&self.ctx, &target).await {
      Ok(origin) => origin,
      Err(e) => {
        tracing::warn!("[{}] Connect to {} failed: {}", self.session.id, target, e);
        return Self::reject(&mut conn, e.into()).await;
      }
    };
    Self::reply(&mut conn, Socks5Response::granted(origin.local_addr()?)).await?;
    self.session.reset_clock();
    relay(&mut self.session, conn.into_io(), origin).await
  }

  async fn bind(&mut self, mut conn: ClientConn, target: TargetAddr) -> Result<()> {
    let listener = match bind_listener(conn.local_addr.ip()).await {
      Ok(listener) => listener,
      Err(e) => return Self::reject(&mut conn, e.into()).await,
    };
    let bound = listener.local_addr()?;
    Self::reply(&mut conn, Socks5Response::granted(bound)).await?;
    tracing::debug!("[{}] SOCKS5 BIND listening on {}", self.session.id, bound);
    let (peer, peer_addr) =
      match accept_bound(listener, &target, self.ctx.config.dial_timeout).await {
        Ok(accepted) => accepted,
        Err(e) => return Self::reject(&mut conn, e).await,
      };
    Self::reply(&mut conn, Socks5Response::granted(peer_addr)).await?;
    self.session.reset_clock();
    relay(&mut self.session, conn.into_io(), peer).await
  }

  /// Grant a UDP association and hold it until the client hangs up.
  ///
  /// Datagrams sent to the socket are not relayed.
  async fn associate(&mut self, mut conn: ClientConn) -> Result<()> {
    let socket = match UdpSocket::bind(SocketAddr::new(conn.local_addr.ip(), 0)).await {
      Ok(socket) => socket,
      Err(e) => return Self::reject(&mut conn, e.into()).await,
    };
    let bound = socket.local_addr()?;
    Self::reply(&mut conn, Socks5Response::granted(bound)).await?;
    tracing::info!(
      "[{}] UDP ASSOCIATE granted on {}, datagram relay is not implemented",
      self.session.id,
      bound
    );
    let mut buf = [0u8; 512];
    while conn.reader.read(&mut buf).await? != 0 {}
    drop(socket);
    Ok(())
  }
}

#[async_trait]
impl Handler for Socks5Handler {
  fn scheme(&self) -> SchemeType {
    SchemeType::Socks5
  }

  async fn serve(&mut self, mut conn: ClientConn) -> Result<()> {
    self.negotiate(&mut conn).await?;
    let request = match Socks5Request::read_from(&mut conn.reader).await {
      Ok(request) => request,
      Err(Error::Reply(reply)) => return Self::reject(&mut conn, reply.into()).await,
      Err(e) => return Err(e),
    };
    self.session.packet.edit.host = request.addr.to_string();
    self.session.packet.edit.method = format!("{:?}", request.command).to_uppercase();
    tracing::debug!(
      "[{}] SOCKS5 {:?} {}",
      self.session.id,
      request.command,
      request.addr
    );
    match request.command {
      Command::Connect => self.connect(conn, request.addr).await,
      Command::Bind => self.bind(conn, request.addr).await,
      Command::Associate => self.associate(conn).await,
      Command::Unknown(code) => {
        Self::reject(&mut conn, ReplyError::CommandNotSupported.into())
          .await
          .map_err(|_| Error::proxy_error(format!("Unsupported SOCKS5 command {:#04x}", code)))
      }
    }
  }
}
