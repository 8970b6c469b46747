//! Session records handed to the event sink
//!
//! A [`Session`] exists per accepted connection (and per TLS-terminated
//! inner connection). Handlers fill its [`Packet`] one direction at a time
//! and call [`Session::emit`] after each half of an exchange.

use crate::events::EventSink;
use crate::tls::TlsInfo;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Leg of the exchange a packet describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StreamDirection {
  /// Client to origin
  #[default]
  Inbound,
  /// Origin to client
  Outbound,
}

impl fmt::Display for StreamDirection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StreamDirection::Inbound => f.write_str("Inbound"),
      StreamDirection::Outbound => f.write_str("Outbound"),
    }
  }
}

/// Protocol a session was classified as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchemeType {
  Http,
  Https,
  WebSocket,
  WebSocketTls,
  Socks4,
  Socks5,
  Tcp,
}

impl SchemeType {
  /// URL scheme used in recorded targets
  pub fn as_str(&self) -> &'static str {
    match self {
      SchemeType::Http => "http",
      SchemeType::Https => "https",
      SchemeType::WebSocket => "ws",
      SchemeType::WebSocketTls => "wss",
      SchemeType::Socks4 => "socks4",
      SchemeType::Socks5 => "socks5",
      SchemeType::Tcp => "tcp",
    }
  }

  /// True for the TLS-terminated variants
  pub fn is_tls(&self) -> bool {
    matches!(self, SchemeType::Https | SchemeType::WebSocketTls)
  }
}

impl fmt::Display for SchemeType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Kind of a relayed WebSocket frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WebsocketMessageType {
  Text,
  Binary,
  Close,
  Ping,
  Pong,
}

impl fmt::Display for WebsocketMessageType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      WebsocketMessageType::Text => "text",
      WebsocketMessageType::Binary => "binary",
      WebsocketMessageType::Close => "close",
      WebsocketMessageType::Ping => "ping",
      WebsocketMessageType::Pong => "pong",
    };
    f.write_str(name)
  }
}

/// Summary columns of an exchange
#[derive(Debug, Clone, Serialize)]
pub struct EditData {
  pub scheme: SchemeType,
  pub method: String,
  pub host: String,
  pub path: String,
  pub content_type: String,
  pub content_length: usize,
  /// Status line text, e.g. `200 OK`
  pub status: String,
  /// Free text shown next to the exchange
  pub note: String,
  /// Name of the local process that opened the connection, when known
  pub process: String,
  /// Time from request to response
  pub elapsed: Duration,
}

impl EditData {
  fn new(scheme: SchemeType) -> Self {
    Self {
      scheme,
      method: String::new(),
      host: String::new(),
      path: String::new(),
      content_type: String::new(),
      content_length: 0,
      status: String::new(),
      note: String::new(),
      process: String::new(),
      elapsed: Duration::ZERO,
    }
  }
}

/// Renderings of one direction's payload
#[derive(Debug, Clone, Default, Serialize)]
pub struct BodyDecoder {
  /// Head plus the first non-empty body rendering
  pub http_dump: String,
  /// Raw bytes as they crossed the proxy
  pub payload: Vec<u8>,
  pub payload_hex_dump: String,
  pub decoded_text: String,
  pub decoded_json: String,
  pub decoded_html: String,
  pub decoded_js: String,
  /// Shell command replaying the request through the proxy
  pub replay_stub: String,
  /// Key taken from an `aeskey` request header
  pub aes_key: Vec<u8>,
  /// Slots owned by external format decoders, keyed by decoder name
  pub plugins: BTreeMap<String, String>,
}

impl BodyDecoder {
  /// Replace payload and hex dump, clearing stale renderings
  pub fn set_payload(&mut self, payload: &[u8]) {
    self.payload = payload.to_vec();
    self.payload_hex_dump = crate::body::hex_dump(payload);
    self.decoded_text.clear();
    self.decoded_json.clear();
    self.decoded_html.clear();
    self.decoded_js.clear();
  }
}

/// Observable record of one exchange
#[derive(Debug, Clone, Serialize)]
pub struct Packet {
  /// Leg filled by the latest emission
  pub direction: StreamDirection,
  pub edit: EditData,
  pub request: BodyDecoder,
  pub response: BodyDecoder,
  pub websocket_message_type: Option<WebsocketMessageType>,
  pub websocket_status: String,
}

impl Packet {
  /// Empty packet for a session of `scheme`
  pub fn new(scheme: SchemeType) -> Self {
    Self {
      direction: StreamDirection::Inbound,
      edit: EditData::new(scheme),
      request: BodyDecoder::default(),
      response: BodyDecoder::default(),
      websocket_message_type: None,
      websocket_status: String::new(),
    }
  }
}

/// Unit of work for one connection
#[derive(Serialize)]
pub struct Session {
  pub id: u64,
  pub peer_addr: SocketAddr,
  pub packet: Packet,
  /// Handshake details when the client leg is TLS-terminated
  pub tls: Option<TlsInfo>,
  #[serde(skip)]
  start: Instant,
  #[serde(skip)]
  events: Arc<dyn EventSink>,
}

impl fmt::Debug for Session {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Session")
      .field("id", &self.id)
      .field("peer_addr", &self.peer_addr)
      .field("packet", &self.packet)
      .field("tls", &self.tls)
      .finish()
  }
}

impl Session {
  /// Start a session for a connection from `peer_addr`
  pub fn new(peer_addr: SocketAddr, scheme: SchemeType, events: Arc<dyn EventSink>) -> Self {
    Self {
      id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
      peer_addr,
      packet: Packet::new(scheme),
      tls: None,
      start: Instant::now(),
      events,
    }
  }

  /// Session for a connection nested inside this one
  pub fn inner(&self, scheme: SchemeType, tls: Option<TlsInfo>) -> Self {
    let mut session = Self::new(self.peer_addr, scheme, self.events.clone());
    session.packet.edit.process = self.packet.edit.process.clone();
    session.tls = tls;
    session
  }

  /// Protocol of this session
  pub fn scheme(&self) -> SchemeType {
    self.packet.edit.scheme
  }

  pub fn set_scheme(&mut self, scheme: SchemeType) {
    self.packet.edit.scheme = scheme;
  }

  /// Direction of the latest emission
  pub fn direction(&self) -> StreamDirection {
    self.packet.direction
  }

  pub fn set_direction(&mut self, direction: StreamDirection) {
    self.packet.direction = direction;
  }

  /// Decoder half belonging to `direction`
  pub fn decoder_mut(&mut self, direction: StreamDirection) -> &mut BodyDecoder {
    match direction {
      StreamDirection::Inbound => &mut self.packet.request,
      StreamDirection::Outbound => &mut self.packet.response,
    }
  }

  /// Decoder half of the latest emission
  pub fn current_decoder(&self) -> &BodyDecoder {
    match self.packet.direction {
      StreamDirection::Inbound => &self.packet.request,
      StreamDirection::Outbound => &self.packet.response,
    }
  }

  /// Restart the clock used for `elapsed`
  pub fn reset_clock(&mut self) {
    self.start = Instant::now();
  }

  /// Time since the session started or the clock was last reset
  pub fn elapsed(&self) -> Duration {
    self.start.elapsed()
  }

  /// Hand a snapshot to the event sink
  pub fn emit(&self) {
    self.events.on_event(self);
  }

  /// Sink events are delivered to
  pub fn events(&self) -> &Arc<dyn EventSink> {
    &self.events
  }
}
