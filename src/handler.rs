//! The capability set every protocol handler implements

use crate::ca::CertificateCache;
use crate::config::ProxyConfig;
use crate::conn::ClientConn;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::http::Connector;
use crate::session::{SchemeType, Session};
use async_trait::async_trait;
use std::sync::Arc;

/// State shared by every connection of one proxy
pub struct ProxyContext {
  pub config: Arc<ProxyConfig>,
  /// Leaf certificates for TLS interception
  pub certs: Arc<CertificateCache>,
  /// Origin dialer with the configured trust settings
  pub connector: Connector,
  pub events: Arc<dyn EventSink>,
}

impl ProxyContext {
  /// Fresh session for a connection from `conn`
  pub fn session(&self, conn: &ClientConn, scheme: SchemeType) -> Session {
    let mut session = Session::new(conn.peer_addr, scheme, self.events.clone());
    session.tls = conn.tls.clone();
    session
  }
}

/// A protocol handler serving one client connection
#[async_trait]
pub trait Handler: Send {
  /// Protocol the handler records its sessions as
  fn scheme(&self) -> SchemeType;

  /// Serve a plaintext connection until either side hangs up
  async fn serve(&mut self, conn: ClientConn) -> Result<()>;

  /// Terminate TLS on `conn`, then serve the decrypted stream
  async fn serve_tls(&mut self, conn: ClientConn) -> Result<()> {
    drop(conn);
    Err(Error::proxy_error(format!(
      "{} handler cannot terminate TLS",
      self.scheme()
    )))
  }

  /// Deliver a session snapshot to the observer
  fn on_event(&self, session: &Session) {
    session.emit();
  }
}
