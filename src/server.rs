//! The proxy listener
//!
//! One task per accepted connection: sniff the first bytes, then hand the
//! connection to the matching [`Handler`]. Per-connection failures are
//! logged here and never reach the accept loop.

use crate::accept::{accept, Backoff};
use crate::ca::{CertificateAuthority, CertificateCache};
use crate::config::ProxyConfig;
use crate::conn::ClientConn;
use crate::error::{Error, Result};
use crate::events::{EventSink, LogSink};
use crate::handler::{Handler, ProxyContext};
use crate::http::{Connector, HttpHandler};
use crate::session::SchemeType;
use crate::sniff::{set_keepalive, sniff, Protocol};
use crate::socks::{Socks4Handler, Socks5Handler};
use crate::tls::HANDSHAKE_RECORD;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// A configured proxy, ready to listen
pub struct Proxy {
  ctx: Arc<ProxyContext>,
}

impl Proxy {
  /// Load or create the root authority and build the shared proxy state.
  ///
  /// Every session is delivered to `sink`; without one they are printed
  /// through the log.
  pub async fn new(config: ProxyConfig, sink: Option<Arc<dyn EventSink>>) -> Result<Self> {
    let ca = CertificateAuthority::load_or_create(
      config.ca_cert_path(),
      config.ca_key_path(),
      config.ca_validity,
      &config.organization,
    )
    .await?;
    let certs = CertificateCache::new(Arc::new(ca), config.leaf_validity)?;
    let connector = Connector::new(&config)?;
    let ctx = ProxyContext {
      config: Arc::new(config),
      certs: Arc::new(certs),
      connector,
      events: LogSink::or_default(sink),
    };
    Ok(Self { ctx: Arc::new(ctx) })
  }

  /// State shared with every handler
  pub fn context(&self) -> &Arc<ProxyContext> {
    &self.ctx
  }

  /// Root authority clients must trust
  pub fn authority(&self) -> &Arc<CertificateAuthority> {
    self.ctx.certs.authority()
  }

  /// Bind the configured address and serve until the listener fails
  pub async fn listen_and_serve(&self) -> Result<()> {
    let addr = self.ctx.config.listen_addr();
    let listener = TcpListener::bind(&addr)
      .await
      .map_err(|e| Error::proxy_error(format!("Failed to bind to {}: {}", addr, e)))?;
    tracing::info!("Proxy listening on {}", addr);
    self.serve(listener).await
  }

  /// Serve connections from an already bound listener
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    let mut backoff = Backoff::default();
    loop {
      let (stream, peer_addr) = accept(&listener, &mut backoff).await?;
      let ctx = self.ctx.clone();
      tokio::spawn(async move {
        if let Err(e) = handle_connection(ctx, stream, peer_addr).await {
          if e.is_disconnect() {
            tracing::debug!("Connection from {} closed: {}", peer_addr, e);
          } else {
            tracing::warn!("Connection from {} failed: {}", peer_addr, e);
          }
        }
      });
    }
  }
}

/// Sniff one connection and run the handler for its protocol
async fn handle_connection(
  ctx: Arc<ProxyContext>,
  stream: TcpStream,
  peer_addr: SocketAddr,
) -> Result<()> {
  if let Err(e) = set_keepalive(&stream) {
    tracing::debug!("Could not enable keep-alive for {}: {}", peer_addr, e);
  }
  let local_addr = stream.local_addr()?;
  let Some((protocol, stream)) = sniff(stream, ctx.config.sniff_timeout).await? else {
    tracing::debug!("{} closed before sending anything", peer_addr);
    return Ok(());
  };
  let starts_tls = stream.prefix().first() == Some(&HANDSHAKE_RECORD);
  let conn = ClientConn::new(stream, peer_addr, local_addr);
  match protocol {
    Protocol::Socks4 => {
      let session = ctx.session(&conn, SchemeType::Socks4);
      Socks4Handler::new(ctx, session).serve(conn).await
    }
    Protocol::Socks5 => {
      let session = ctx.session(&conn, SchemeType::Socks5);
      Socks5Handler::new(ctx, session).serve(conn).await
    }
    Protocol::Http => {
      let session = ctx.session(&conn, SchemeType::Http);
      let mut handler = HttpHandler::new(ctx, session);
      if starts_tls {
        handler.serve_tls(conn).await
      } else {
        handler.serve(conn).await
      }
    }
  }
}
