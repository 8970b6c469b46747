//! WebSocket interception
//!
//! The origin leg is dialled first with a fresh handshake; only once it is
//! up does the client get its `101 Switching Protocols`, carrying the
//! subprotocol and cookies the origin chose. Frames are then relayed one
//! message at a time, each message becoming one session event.

use crate::conn::ClientConn;
use crate::error::{Error, Result};
use crate::handler::{Handler, ProxyContext};
use crate::http::{HttpRequest, HttpResponse, HOP_BY_HOP_HEADERS};
use crate::session::{SchemeType, Session, StreamDirection, WebsocketMessageType};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::header::{
  HeaderName, HeaderValue, CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS,
  SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, SET_COOKIE, UPGRADE,
};
use http::{HeaderMap, StatusCode};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Headers negotiated separately on each leg
const NEGOTIATION_HEADERS: &[HeaderName] = &[
  SEC_WEBSOCKET_KEY,
  SEC_WEBSOCKET_VERSION,
  SEC_WEBSOCKET_EXTENSIONS,
  SEC_WEBSOCKET_ACCEPT,
  HOST,
];

/// Relays one upgraded WebSocket connection
pub struct WebSocketHandler {
  ctx: Arc<ProxyContext>,
  session: Session,
  request: HttpRequest,
  default_host: Option<String>,
}

impl WebSocketHandler {
  /// `request` is the client's upgrade request, already read off the
  /// connection. Sessions on a TLS-terminated leg are recorded as `wss`.
  pub fn new(
    ctx: Arc<ProxyContext>,
    mut session: Session,
    request: HttpRequest,
    default_host: Option<String>,
  ) -> Self {
    let scheme = if session.scheme().is_tls() || session.tls.is_some() {
      SchemeType::WebSocketTls
    } else {
      SchemeType::WebSocket
    };
    session.set_scheme(scheme);
    Self {
      ctx,
      session,
      request,
      default_host,
    }
  }

  fn authority(&self) -> Result<String> {
    let host = self.request.host();
    if !host.is_empty() {
      return Ok(host);
    }
    self
      .default_host
      .clone()
      .filter(|h| !h.is_empty())
      .ok_or_else(|| Error::invalid_request("WebSocket upgrade names no host"))
  }

  /// Upgrade request for the origin, minus the client's negotiation headers
  fn origin_request(&self, url: &str, authority: &str) -> Result<http::Request<()>> {
    let mut request = http::Request::builder()
      .method(http::Method::GET)
      .uri(url)
      .body(())?;
    let headers = request.headers_mut();
    for (name, value) in &self.request.headers {
      if NEGOTIATION_HEADERS.contains(name) || HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
        continue;
      }
      headers.append(name.clone(), value.clone());
    }
    headers.insert(
      HOST,
      HeaderValue::from_str(authority).map_err(|e| Error::HttpError(e.into()))?,
    );
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    headers.insert(
      SEC_WEBSOCKET_KEY,
      HeaderValue::from_str(&generate_key()).map_err(|e| Error::HttpError(e.into()))?,
    );
    Ok(request)
  }

  async fn reject(&mut self, conn: &mut ClientConn, response: HttpResponse, note: String) {
    if let Err(e) = conn.writer().write_all(&response.to_raw(true)).await {
      tracing::debug!("Failed to answer WebSocket client: {}", e);
    }
    let session = &mut self.session;
    session.set_direction(StreamDirection::Outbound);
    session.packet.edit.status = response.status_text();
    session.packet.edit.note = note;
    session.packet.edit.elapsed = session.elapsed();
    session.decoder_mut(StreamDirection::Outbound).set_payload(&[]);
    self.on_event(&self.session);
  }
}

/// `101 Switching Protocols` for the client, echoing what the origin agreed to
fn switching_protocols(key: &str, origin_headers: &HeaderMap) -> Vec<u8> {
  let mut headers = HeaderMap::new();
  headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
  headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
  if let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) {
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
  }
  if let Some(protocol) = origin_headers.get(SEC_WEBSOCKET_PROTOCOL) {
    headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
  }
  for cookie in origin_headers.get_all(SET_COOKIE) {
    headers.append(SET_COOKIE, cookie.clone());
  }
  let mut buf = b"HTTP/1.1 101 Switching Protocols\r\n".to_vec();
  crate::http::write_headers(&mut buf, &headers);
  buf.extend_from_slice(b"\r\n");
  buf
}

#[async_trait]
impl Handler for WebSocketHandler {
  fn scheme(&self) -> SchemeType {
    self.session.scheme()
  }

  async fn serve(&mut self, mut conn: ClientConn) -> Result<()> {
    let Some(key) = self
      .request
      .headers
      .get(SEC_WEBSOCKET_KEY)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string)
    else {
      let response = HttpResponse::simple(StatusCode::BAD_REQUEST);
      conn.writer().write_all(&response.to_raw(true)).await?;
      return Err(Error::invalid_request("WebSocket upgrade without Sec-WebSocket-Key"));
    };
    let authority = self.authority()?;
    let tls = self.session.scheme() == SchemeType::WebSocketTls;
    let (host, port) = crate::http::request::split_host_port(&authority);
    let port = port.unwrap_or(if tls { 443 } else { 80 });
    let path = self.request.path();
    let url = format!("{}://{}{}", self.session.scheme(), authority, path);
    self.session.packet.edit.host = authority.clone();
    self.session.packet.edit.path = path;
    tracing::debug!("WebSocket upgrade to {}", url);

    let origin_request = self.origin_request(&url, &authority)?;
    let dial = async {
      let stream = self.ctx.connector.open(&host, port, tls).await?;
      let handshake = tokio_tungstenite::client_async(origin_request, stream);
      match tokio::time::timeout(self.ctx.config.handshake_timeout, handshake).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::connection_error(format!(
          "WebSocket handshake with {} timed out",
          url
        ))),
      }
    };
    let dialed = dial.await;
    let (origin, origin_response) = match dialed {
      Ok(pair) => pair,
      Err(e) => {
        let note = e.to_string();
        self
          .reject(&mut conn, HttpResponse::bad_gateway(&note), note)
          .await;
        return Err(e);
      }
    };

    conn
      .writer()
      .write_all(&switching_protocols(&key, origin_response.headers()))
      .await?;
    conn.writer().flush().await?;
    let client = WebSocketStream::from_raw_socket(conn.into_io(), Role::Server, None).await;
    self.session.reset_clock();
    relay(&mut self.session, client, origin).await
  }
}

/// Relay messages between both legs until one of them closes.
///
/// Client messages are recorded as Inbound, origin messages as Outbound.
pub async fn relay<C, O>(
  session: &mut Session,
  client: WebSocketStream<C>,
  origin: WebSocketStream<O>,
) -> Result<()>
where
  C: AsyncRead + AsyncWrite + Unpin,
  O: AsyncRead + AsyncWrite + Unpin,
{
  let (client_tx, client_rx) = client.split();
  let (origin_tx, origin_rx) = origin.split();
  let shared = Mutex::new(session);
  tokio::select! {
    result = relay_messages(&shared, StreamDirection::Inbound, client_rx, origin_tx) => result,
    result = relay_messages(&shared, StreamDirection::Outbound, origin_rx, client_tx) => result,
  }
}

async fn relay_messages<R, W>(
  session: &Mutex<&mut Session>,
  direction: StreamDirection,
  mut rx: R,
  mut tx: W,
) -> Result<()>
where
  R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
  W: Sink<Message, Error = WsError> + Unpin,
{
  let mut close_code = None;
  loop {
    let message = match rx.next().await {
      None | Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => break,
      Some(Ok(message)) => message,
      Some(Err(e)) => return Err(e.into()),
    };
    if matches!(message, Message::Frame(_)) {
      continue;
    }
    record(session, direction, &message);
    // each leg answers the pings it reads, so pongs stop here
    if matches!(message, Message::Pong(_)) {
      continue;
    }
    if let Message::Close(frame) = &message {
      close_code = Some(frame.as_ref().map(|f| f.code).unwrap_or(CloseCode::Status));
      // the opposite leg may already be closing
      if let Err(e) = tx.send(message).await {
        tracing::debug!("Forwarding close frame failed: {}", e);
      }
      continue;
    }
    tx.send(message).await?;
  }
  match close_code {
    Some(CloseCode::Abnormal) => Err(Error::connection_error(format!(
      "{} WebSocket leg closed abnormally",
      direction
    ))),
    _ => Ok(()),
  }
}

fn record(session: &Mutex<&mut Session>, direction: StreamDirection, message: &Message) {
  let Ok(mut session) = session.lock() else {
    return;
  };
  let (kind, payload): (WebsocketMessageType, &[u8]) = match message {
    Message::Text(text) => (WebsocketMessageType::Text, text.as_bytes()),
    Message::Binary(data) => (WebsocketMessageType::Binary, data.as_slice()),
    Message::Ping(data) => (WebsocketMessageType::Ping, data.as_slice()),
    Message::Pong(data) => (WebsocketMessageType::Pong, data.as_slice()),
    Message::Close(frame) => (
      WebsocketMessageType::Close,
      frame.as_ref().map(|f| f.reason.as_bytes()).unwrap_or_default(),
    ),
    Message::Frame(_) => return,
  };
  session.set_direction(direction);
  session.packet.edit.method = direction.to_string();
  session.packet.edit.content_type = kind.to_string();
  session.packet.edit.content_length = payload.len();
  session.packet.websocket_message_type = Some(kind);
  session.packet.websocket_status = match message {
    Message::Close(Some(frame)) => format!("{} {}", u16::from(frame.code), frame.reason)
      .trim_end()
      .to_string(),
    Message::Close(None) => u16::from(CloseCode::Status).to_string(),
    _ => String::new(),
  };
  if direction == StreamDirection::Outbound {
    session.packet.edit.elapsed = session.elapsed();
  }
  let decoder = session.decoder_mut(direction);
  decoder.set_payload(payload);
  if let Message::Text(text) = message {
    decoder.decoded_text = text.clone();
  }
  session.emit();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::events::EventSink;
  use std::net::SocketAddr;
  use tokio_tungstenite::tungstenite::protocol::CloseFrame;

  #[test]
  fn test_switching_protocols_echoes_origin_choices() {
    let mut origin = HeaderMap::new();
    origin.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat"));
    origin.append(SET_COOKIE, HeaderValue::from_static("a=1"));
    origin.append(SET_COOKIE, HeaderValue::from_static("b=2"));
    let raw = String::from_utf8(switching_protocols("dGhlIHNhbXBsZSBub25jZQ==", &origin)).unwrap();
    assert!(raw.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(raw.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(raw.contains("sec-websocket-protocol: chat\r\n"));
    assert!(raw.contains("set-cookie: a=1\r\n"));
    assert!(raw.contains("set-cookie: b=2\r\n"));
    assert!(raw.ends_with("\r\n\r\n"));
  }

  #[tokio::test]
  async fn test_relay_records_each_message() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink: Arc<dyn EventSink> = {
      let events = events.clone();
      Arc::new(move |s: &Session| {
        events.lock().unwrap().push((
          s.direction(),
          s.packet.websocket_message_type,
          s.current_decoder().payload.clone(),
          s.packet.websocket_status.clone(),
        ))
      })
    };
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let mut session = Session::new(addr, SchemeType::WebSocket, sink);

    let (client_io, client_peer_io) = tokio::io::duplex(4096);
    let (origin_io, origin_peer_io) = tokio::io::duplex(4096);
    let client = WebSocketStream::from_raw_socket(client_io, Role::Server, None).await;
    let origin = WebSocketStream::from_raw_socket(origin_io, Role::Client, None).await;
    let mut client_peer = WebSocketStream::from_raw_socket(client_peer_io, Role::Client, None).await;
    let mut origin_peer = WebSocketStream::from_raw_socket(origin_peer_io, Role::Server, None).await;

    let origin_task = tokio::spawn(async move {
      let first = origin_peer.next().await.unwrap().unwrap();
      assert_eq!(first, Message::Text("hello".into()));
      origin_peer.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
      while let Some(Ok(_)) = origin_peer.next().await {}
    });
    let client_task = tokio::spawn(async move {
      client_peer.send(Message::Text("hello".into())).await.unwrap();
      let reply = client_peer.next().await.unwrap().unwrap();
      assert_eq!(reply, Message::Binary(vec![1, 2, 3]));
      client_peer
        .close(Some(CloseFrame {
          code: CloseCode::Normal,
          reason: "bye".into(),
        }))
        .await
        .unwrap();
      while let Some(Ok(_)) = client_peer.next().await {}
    });

    relay(&mut session, client, origin).await.unwrap();
    client_task.await.unwrap();
    origin_task.await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
      events[0],
      (
        StreamDirection::Inbound,
        Some(WebsocketMessageType::Text),
        b"hello".to_vec(),
        String::new()
      )
    );
    assert_eq!(events[1].0, StreamDirection::Outbound);
    assert_eq!(events[1].1, Some(WebsocketMessageType::Binary));
    assert_eq!(events[1].2, vec![1, 2, 3]);
    let close = events
      .iter()
      .find(|e| e.0 == StreamDirection::Inbound && e.1 == Some(WebsocketMessageType::Close))
      .unwrap();
    assert_eq!(close.3, "1000 bye");
  }

  #[tokio::test]
  async fn test_ping_answered_once() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink: Arc<dyn EventSink> = {
      let events = events.clone();
      Arc::new(move |s: &Session| {
        events.lock().unwrap().push(s.packet.websocket_message_type);
      })
    };
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let mut session = Session::new(addr, SchemeType::WebSocket, sink);

    let (client_io, client_peer_io) = tokio::io::duplex(4096);
    let (origin_io, origin_peer_io) = tokio::io::duplex(4096);
    let client = WebSocketStream::from_raw_socket(client_io, Role::Server, None).await;
    let origin = WebSocketStream::from_raw_socket(origin_io, Role::Client, None).await;
    let mut client_peer = WebSocketStream::from_raw_socket(client_peer_io, Role::Client, None).await;
    let mut origin_peer = WebSocketStream::from_raw_socket(origin_peer_io, Role::Server, None).await;

    let origin_task = tokio::spawn(async move {
      let first = origin_peer.next().await.unwrap().unwrap();
      assert_eq!(first, Message::Ping(vec![7]));
      let second = origin_peer.next().await.unwrap().unwrap();
      assert_eq!(second, Message::Text("after ping".into()));
      while let Some(Ok(_)) = origin_peer.next().await {}
    });
    let client_task = tokio::spawn(async move {
      client_peer.send(Message::Ping(vec![7])).await.unwrap();
      client_peer.send(Message::Text("after ping".into())).await.unwrap();
      let pong = client_peer.next().await.unwrap().unwrap();
      assert_eq!(pong, Message::Pong(vec![7]));
      client_peer.close(None).await.unwrap();
      while let Some(Ok(message)) = client_peer.next().await {
        assert!(!matches!(message, Message::Pong(_)));
      }
    });

    relay(&mut session, client, origin).await.unwrap();
    client_task.await.unwrap();
    origin_task.await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events[0], Some(WebsocketMessageType::Ping));
    assert!(events.contains(&Some(WebsocketMessageType::Text)));
  }
}
