//! The HTTP proxy state machine
//!
//! One [`HttpHandler`] serves one client connection, request after request.
//! `CONNECT` either hands the stream to a raw tunnel or intercepts it: the
//! handler answers `200 Connection Established`, peeks the next byte and
//! serves the rest of the connection through a nested handler, TLS
//! terminated when the client starts a handshake.

use super::{strip_hop_by_hop, HttpRequest, HttpResponse};
use crate::body::{curl_command, fill_decoder};
use crate::conn::ClientConn;
use crate::error::{Error, Result};
use crate::handler::{Handler, ProxyContext};
use crate::session::{SchemeType, Session, StreamDirection};
use crate::tls::{accept_tls, HANDSHAKE_RECORD};
use crate::tunnel::TcpHandler;
use crate::websocket::WebSocketHandler;
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

const AES_KEY_HEADER: &str = "aeskey";
const AES_KEY_NOTE: &str = "SteamAesKey hooked";
/// Intercepted connections may not intercept again
const MAX_DEPTH: u8 = 1;

/// Serves HTTP/1.x on one client connection
pub struct HttpHandler {
  ctx: Arc<ProxyContext>,
  session: Session,
  /// Number of interception layers around this connection
  depth: u8,
  /// CONNECT target the connection was opened for
  default_host: Option<String>,
}

impl HttpHandler {
  pub fn new(ctx: Arc<ProxyContext>, session: Session) -> Self {
    Self {
      ctx,
      session,
      depth: 0,
      default_host: None,
    }
  }

  /// Handler for the connection nested inside a CONNECT to `authority`
  fn inner(&self, scheme: SchemeType, authority: String) -> Self {
    Self {
      ctx: self.ctx.clone(),
      session: self.handoff(scheme),
      depth: self.depth + 1,
      default_host: Some(authority),
    }
  }

  /// Session for whatever takes the connection over from this handler
  fn handoff(&self, scheme: SchemeType) -> Session {
    let mut session = self.session.inner(scheme, self.session.tls.clone());
    session.packet.request.aes_key = self.session.packet.request.aes_key.clone();
    session.packet.edit.note = self.session.packet.edit.note.clone();
    session
  }

  fn record_aes_key(&mut self, request: &HttpRequest) {
    match request.headers.get(AES_KEY_HEADER) {
      Some(value) => {
        self.session.packet.request.aes_key = parse_aes_key(value.as_bytes());
        self.session.packet.edit.note = AES_KEY_NOTE.to_string();
      }
      None => self.session.packet.edit.note.clear(),
    }
  }

  /// Fill and emit the Inbound half of an exchange
  fn record_request(&mut self, request: &HttpRequest) {
    let proxy = self.ctx.config.listen_addr();
    let session = &mut self.session;
    session.set_direction(StreamDirection::Inbound);
    let edit = &mut session.packet.edit;
    edit.method = request.method.to_string();
    edit.host = request.hostname();
    edit.path = request.path();
    edit.content_type = request.content_type();
    edit.content_length = request.body.len();
    edit.status.clear();
    edit.elapsed = Default::default();
    let decoder = session.decoder_mut(StreamDirection::Inbound);
    fill_decoder(decoder, &request.head(), &request.headers, &request.body);
    decoder.replay_stub = curl_command(
      &request.method,
      &request.uri,
      &request.headers,
      &request.body,
      &proxy,
    );
    self.on_event(&self.session);
  }

  /// Fill and emit the Outbound half of an exchange
  fn record_response(&mut self, response: &HttpResponse, note: Option<String>) {
    let session = &mut self.session;
    session.set_direction(StreamDirection::Outbound);
    session.packet.edit.status = response.status_text();
    session.packet.edit.content_type = response.content_type();
    session.packet.edit.content_length = response.body.len();
    session.packet.edit.elapsed = session.elapsed();
    if let Some(note) = note {
      session.packet.edit.note = note;
    }
    let decoder = session.decoder_mut(StreamDirection::Outbound);
    fill_decoder(decoder, &response.head(), &response.headers, &response.body);
    self.on_event(&self.session);
  }

  /// Answer a CONNECT and serve what follows through a nested handler
  async fn intercept(&mut self, mut conn: ClientConn, request: HttpRequest) -> Result<()> {
    if self.depth >= MAX_DEPTH {
      tracing::warn!(
        "[{}] Refusing nested CONNECT to {}",
        self.session.id,
        request.host()
      );
      let response = HttpResponse::simple(StatusCode::METHOD_NOT_ALLOWED);
      conn.writer().write_all(&response.to_raw(true)).await?;
      return Ok(());
    }
    let authority = request.host();
    if authority.is_empty() {
      let response = HttpResponse::simple(StatusCode::BAD_REQUEST);
      conn.writer().write_all(&response.to_raw(true)).await?;
      return Err(Error::invalid_request("CONNECT without a target"));
    }
    conn
      .writer()
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    conn.writer().flush().await?;
    let buffered = conn.reader.fill_buf().await?;
    let Some(&first) = buffered.first() else {
      return Ok(());
    };
    tracing::debug!("[{}] Intercepting CONNECT to {}", self.session.id, authority);
    if first == HANDSHAKE_RECORD {
      self
        .inner(SchemeType::Https, authority)
        .serve_tls(conn)
        .await
    } else {
      self.inner(SchemeType::Http, authority).serve(conn).await
    }
  }

  /// Forward one request and relay the response.
  ///
  /// Returns whether the connection may carry another request.
  async fn exchange(&mut self, conn: &mut ClientConn, mut request: HttpRequest) -> Result<bool> {
    let scheme = if self.session.scheme() == SchemeType::Https {
      "https"
    } else {
      "http"
    };
    let default_host = self.default_host.clone().unwrap_or_default();
    let close = request.wants_close();
    if let Err(e) = request.normalize(scheme, &default_host) {
      let response = HttpResponse::simple(StatusCode::BAD_REQUEST);
      conn.writer().write_all(&response.to_raw(true)).await?;
      return Err(e);
    }
    self.record_request(&request);

    match self.ctx.connector.round_trip(&request).await {
      Ok(response) => {
        self.record_response(&response, None);
        conn.writer().write_all(&response.to_raw(close)).await?;
        conn.writer().flush().await?;
        Ok(!close)
      }
      Err(e) => {
        let note = e.to_string();
        tracing::debug!("[{}] Round trip to {} failed: {}", self.session.id, request.uri, note);
        let response = HttpResponse::bad_gateway(&note);
        self.record_response(&response, Some(note));
        conn.writer().write_all(&response.to_raw(true)).await?;
        conn.writer().flush().await?;
        Ok(false)
      }
    }
  }
}

/// Key bytes from an `aeskey` header: hex when it decodes, raw otherwise
fn parse_aes_key(value: &[u8]) -> Vec<u8> {
  hex::decode(value).unwrap_or_else(|_| value.to_vec())
}

#[async_trait]
impl Handler for HttpHandler {
  fn scheme(&self) -> SchemeType {
    self.session.scheme()
  }

  async fn serve(&mut self, mut conn: ClientConn) -> Result<()> {
    loop {
      let Some(mut request) = HttpRequest::read(&mut conn.reader).await? else {
        return Ok(());
      };
      self.session.reset_clock();

      if self.depth == 0 && self.ctx.config.tunnel_ip_hosts && request.is_ip_host() {
        let session = self.handoff(SchemeType::Tcp);
        let host = request.hostname();
        let mut handler = if request.is_connect() {
          TcpHandler::new(self.ctx.clone(), session, &host, request.port(443)).reply_established()
        } else {
          strip_hop_by_hop(&mut request.headers);
          TcpHandler::new(self.ctx.clone(), session, &host, request.port(80))
            .with_preface(request.to_raw(true, false))
        };
        return handler.serve(conn).await;
      }

      self.record_aes_key(&request);

      if request.is_websocket_upgrade() {
        let scheme = if self.session.scheme().is_tls() {
          SchemeType::WebSocketTls
        } else {
          SchemeType::WebSocket
        };
        let mut handler = WebSocketHandler::new(
          self.ctx.clone(),
          self.handoff(scheme),
          request,
          self.default_host.clone(),
        );
        return handler.serve(conn).await;
      }

      if request.is_connect() {
        return self.intercept(conn, request).await;
      }

      if !self.exchange(&mut conn, request).await? {
        return Ok(());
      }
    }
  }

  async fn serve_tls(&mut self, conn: ClientConn) -> Result<()> {
    let (peer_addr, local_addr) = (conn.peer_addr, conn.local_addr);
    let fallback = match &self.default_host {
      Some(authority) => super::request::split_host_port(authority).0,
      None => local_addr.ip().to_string(),
    };
    let (stream, info) = accept_tls(
      conn.into_io(),
      &fallback,
      &self.ctx.certs,
      self.ctx.config.handshake_timeout,
    )
    .await?;
    tracing::debug!(
      "[{}] TLS terminated for {} ({:?})",
      self.session.id,
      info.sni.as_deref().unwrap_or(&fallback),
      info.version
    );
    if self.default_host.is_none() {
      self.default_host = info.sni.clone();
    }
    self.session.set_scheme(SchemeType::Https);
    self.session.tls = Some(info.clone());
    self.depth = self.depth.max(MAX_DEPTH);
    self
      .serve(ClientConn::new(stream, peer_addr, local_addr).with_tls(info))
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_aes_key() {
    assert_eq!(parse_aes_key(b"00ff10"), vec![0x00, 0xff, 0x10]);
    assert_eq!(parse_aes_key(b"not-hex"), b"not-hex".to_vec());
  }
}
