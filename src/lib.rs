//! # mitmproxy
//!
//! An interactive man-in-the-middle proxy. One listening port accepts
//! plain HTTP, `CONNECT` (with TLS interception), WebSocket upgrades,
//! SOCKS4/4a and SOCKS5; raw TCP is tunnelled. Every observed exchange is
//! delivered to an [`EventSink`] as a [`Session`] snapshot tagged with its
//! [`StreamDirection`].
//!
//! - A root authority is loaded from disk or created on first start
//! - Per-host leaf certificates are minted on demand and cached
//! - Bodies are decoded (gzip, charsets, JSON) for display
//! - Every HTTP request carries a `curl` command that replays it
//!
//! ```no_run
//! use mitmproxy::{EventSink, Proxy, ProxyConfig, Session};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let sink: Arc<dyn EventSink> = Arc::new(|session: &Session| {
//!     println!("{} {}", session.packet.direction, session.packet.edit.host);
//!   });
//!   let proxy = Proxy::new(ProxyConfig::default(), Some(sink)).await?;
//!   proxy.listen_and_serve().await?;
//!   Ok(())
//! }
//! ```
//!
//! ## Optional Features
//!
//! - **gzip**: inflate gzip bodies before rendering them (default)
//! - **charset**: decode text bodies with the charset named in
//!   `Content-Type` (default)

mod accept;
pub mod body;
pub mod ca;
pub mod cert_server;
pub mod config;
pub mod conn;
pub mod error;
pub mod events;
pub mod handler;
pub mod http;
pub mod server;
pub mod session;
pub mod sniff;
pub mod socks;
pub mod tls;
pub mod tunnel;
pub mod websocket;

pub use ca::{CertificateAuthority, CertificateCache};
pub use cert_server::CertServer;
pub use config::ProxyConfig;
pub use error::{Error, ReplyError, Result};
pub use events::{EventSink, LogSink, NoopSink};
pub use handler::{Handler, ProxyContext};
pub use server::Proxy;
pub use session::{
  BodyDecoder, EditData, Packet, SchemeType, Session, StreamDirection, WebsocketMessageType,
};
