//! TLS on both legs of an intercepted connection
//!
//! The client leg is terminated with a leaf minted for the name the client
//! asked for. The origin leg is a normal rustls client, optionally with
//! certificate checks switched off.

use crate::ca::{crypto_provider, CertificateCache};
use crate::error::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TLSError, RootCertStore, ServerConfig,
  SignatureScheme,
};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

/// First byte of a TLS handshake record
pub const HANDSHAKE_RECORD: u8 = 0x16;

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// What the client negotiated on a terminated TLS leg
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TlsInfo {
  /// Server name from the ClientHello
  pub sni: Option<String>,
  /// Negotiated application protocol
  pub alpn: Option<String>,
  /// Negotiated protocol version, e.g. `TLSv1_3`
  pub version: Option<String>,
}

/// Terminate TLS on `io` with a leaf for the client's SNI.
///
/// `fallback_host` is used when the ClientHello carries no server name,
/// which is the CONNECT target for intercepted tunnels.
pub async fn accept_tls<IO>(
  io: IO,
  fallback_host: &str,
  cache: &CertificateCache,
  handshake_timeout: Duration,
) -> Result<(TlsStream<IO>, TlsInfo)>
where
  IO: AsyncRead + AsyncWrite + Unpin,
{
  let handshake = async {
    let start = LazyConfigAcceptor::new(Acceptor::default(), io)
      .await
      .map_err(|e| Error::tls_error(format!("Failed to read ClientHello: {}", e)))?;
    let sni = start.client_hello().server_name().map(str::to_string);
    let host = sni.as_deref().unwrap_or(fallback_host);
    let config = server_config(cache, host).await?;
    let stream = start
      .into_stream(config)
      .await
      .map_err(|e| Error::tls_error(format!("TLS handshake with client failed: {}", e)))?;
    let info = {
      let (_, conn) = stream.get_ref();
      TlsInfo {
        sni,
        alpn: conn
          .alpn_protocol()
          .map(|p| String::from_utf8_lossy(p).into_owned()),
        version: conn.protocol_version().map(|v| format!("{:?}", v)),
      }
    };
    Ok((stream, info))
  };
  match tokio::time::timeout(handshake_timeout, handshake).await {
    Ok(result) => result,
    Err(_) => Err(Error::tls_error(format!(
      "TLS handshake for {} timed out",
      fallback_host
    ))),
  }
}

/// Server config presenting the leaf for `host`
pub async fn server_config(cache: &CertificateCache, host: &str) -> Result<Arc<ServerConfig>> {
  let leaf = cache.get_or_create(host).await?;
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(leaf.chain.clone(), cache.private_key()?)?;
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(Arc::new(config))
}

/// Client config for origin connections.
///
/// With `verify` the platform's trust store decides; without it every
/// certificate is accepted.
pub fn client_config(verify: bool) -> Result<Arc<ClientConfig>> {
  let builder = ClientConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()?;
  let mut config = if verify {
    builder
      .with_root_certificates(native_roots())
      .with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(Arc::new(config))
}

fn native_roots() -> RootCertStore {
  let mut roots = RootCertStore::empty();
  let loaded = rustls_native_certs::load_native_certs();
  for e in &loaded.errors {
    tracing::warn!("Skipping native root: {}", e);
  }
  let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
  tracing::debug!("Loaded {} native roots, ignored {}", added, ignored);
  if roots.is_empty() {
    tracing::warn!("No native root certificates found, origin TLS will fail to verify");
  }
  roots
}

/// Server name for an origin host, IP literals included
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  ServerName::try_from(host.to_string())
    .map_err(|e| Error::tls_error(format!("Invalid server name {}: {}", host, e)))
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls12_signature(
      message,
      cert,
      dss,
      &crypto_provider().signature_verification_algorithms,
    )
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls13_signature(
      message,
      cert,
      dss,
      &crypto_provider().signature_verification_algorithms,
    )
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    crypto_provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}
