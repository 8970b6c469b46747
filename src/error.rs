//! Error types for the proxy

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate error
  #[error("Certificate error: {0}")]
  CertificateError(String),

  /// TLS error
  #[error("TLS error: {0}")]
  TlsError(String),

  /// HTTP parsing error
  #[error("HTTP error: {0}")]
  HttpError(http::Error),

  /// WebSocket error
  #[error("WebSocket error: {0}")]
  WebSocketError(tokio_tungstenite::tungstenite::Error),

  /// Proxy error
  #[error("Proxy error: {0}")]
  ProxyError(String),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Connection error
  #[error("Connection error: {0}")]
  ConnectionError(String),

  /// SOCKS reply error
  #[error("SOCKS reply: {0}")]
  Reply(#[from] ReplyError),
}

/// SOCKS5 reply codes other than success, as defined by RFC 1928
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
  /// 0x01
  #[error("General failure")]
  GeneralFailure,
  /// 0x02
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed,
  /// 0x03
  #[error("Network unreachable")]
  NetworkUnreachable,
  /// 0x04
  #[error("Host unreachable")]
  HostUnreachable,
  /// 0x05
  #[error("Connection refused")]
  ConnectionRefused,
  /// 0x06
  #[error("TTL expired")]
  TtlExpired,
  /// 0x07
  #[error("Command not supported")]
  CommandNotSupported,
  /// 0x08
  #[error("Address type not supported")]
  AddressTypeNotSupported,
}

impl ReplyError {
  /// Wire value of the reply code
  pub fn code(&self) -> u8 {
    match self {
      ReplyError::GeneralFailure => 0x01,
      ReplyError::ConnectionNotAllowed => 0x02,
      ReplyError::NetworkUnreachable => 0x03,
      ReplyError::HostUnreachable => 0x04,
      ReplyError::ConnectionRefused => 0x05,
      ReplyError::TtlExpired => 0x06,
      ReplyError::CommandNotSupported => 0x07,
      ReplyError::AddressTypeNotSupported => 0x08,
    }
  }

  /// Reply for a wire code; `None` for success, unknown codes are general failures
  pub fn from_code(code: u8) -> Option<Self> {
    let reply = match code {
      0x00 => return None,
      0x02 => ReplyError::ConnectionNotAllowed,
      0x03 => ReplyError::NetworkUnreachable,
      0x04 => ReplyError::HostUnreachable,
      0x05 => ReplyError::ConnectionRefused,
      0x06 => ReplyError::TtlExpired,
      0x07 => ReplyError::CommandNotSupported,
      0x08 => ReplyError::AddressTypeNotSupported,
      _ => ReplyError::GeneralFailure,
    };
    Some(reply)
  }

  /// Map a failed dial to the reply code a SOCKS client understands.
  pub fn from_io(err: &io::Error) -> Self {
    match err.kind() {
      io::ErrorKind::ConnectionRefused => ReplyError::ConnectionRefused,
      io::ErrorKind::TimedOut => ReplyError::TtlExpired,
      io::ErrorKind::PermissionDenied => ReplyError::ConnectionNotAllowed,
      _ => {
        let text = err.to_string().to_ascii_lowercase();
        if text.contains("network is unreachable") {
          ReplyError::NetworkUnreachable
        } else if text.contains("no route to host") || text.contains("host is unreachable") {
          ReplyError::HostUnreachable
        } else {
          ReplyError::GeneralFailure
        }
      }
    }
  }
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::CertificateError(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::TlsError(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create a proxy error and log it
  pub fn proxy_error(msg: impl Into<String>) -> Self {
    let error = Error::ProxyError(msg.into());
    tracing::error!("Proxy error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("Invalid request: {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::ConnectionError(msg.into());
    tracing::error!("Connection error: {}", error);
    error
  }

  /// True when the error only means the peer went away.
  ///
  /// Closing the client connection is how every session ends, so callers
  /// log these at debug level instead of treating them as failures.
  pub fn is_disconnect(&self) -> bool {
    match self {
      Error::Io(e) => matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
          | io::ErrorKind::ConnectionReset
          | io::ErrorKind::ConnectionAborted
          | io::ErrorKind::BrokenPipe
          | io::ErrorKind::NotConnected
      ),
      Error::WebSocketError(e) => matches!(
        e,
        tokio_tungstenite::tungstenite::Error::ConnectionClosed
          | tokio_tungstenite::tungstenite::Error::AlreadyClosed
      ),
      _ => false,
    }
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("IO error: {}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::HttpError(value);
    tracing::error!("HTTP error: {}", error);
    error
  }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
  fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
    let error = Error::WebSocketError(value);
    tracing::debug!("WebSocket error: {}", error);
    error
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::tls_error(value.to_string())
  }
}
