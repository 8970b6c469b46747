//! Proxy configuration
//!
//! Built once at startup and shared through an `Arc`. Nothing in the crate
//! reads configuration from globals.

use std::path::PathBuf;
use std::time::Duration;

/// Port the proxy listens on when none is given
pub const DEFAULT_PORT: &str = "7890";
/// Port of the root certificate download endpoint
pub const DEFAULT_FILE_SERVER_PORT: u16 = 7777;
/// Root certificate file name
pub const CA_CERT_FILE: &str = "ca.crt";
/// Root private key file name
pub const CA_KEY_FILE: &str = "ca.key";

/// Configuration for the proxy
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// Interface to bind
  pub host: String,
  /// Listen port, an empty string selects [`DEFAULT_PORT`]
  pub port: String,
  /// Port for the root certificate endpoint
  pub file_server_port: u16,
  /// Directory holding the root certificate and key
  pub ca_dir: PathBuf,
  /// Root certificate file name inside `ca_dir`
  pub ca_cert_file: String,
  /// Root key file name inside `ca_dir`
  pub ca_key_file: String,
  /// Validity of the root certificate on either side of its creation time
  pub ca_validity: Duration,
  /// Validity of minted leaf certificates on either side of their creation time
  pub leaf_validity: Duration,
  /// Organization written into the root and leaf subjects
  pub organization: String,
  /// Read deadline for the protocol sniff
  pub sniff_timeout: Duration,
  /// Connect timeout for origin and SOCKS targets
  pub dial_timeout: Duration,
  /// Deadline for TLS handshakes on either leg
  pub handshake_timeout: Duration,
  /// Username and password required from SOCKS5 clients
  pub socks_credentials: Option<(String, String)>,
  /// Verify origin certificates against the native root store
  pub verify_upstream: bool,
  /// Relay requests addressed to a bare IP as raw TCP
  pub tunnel_ip_hosts: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      host: "127.0.0.1".to_string(),
      port: DEFAULT_PORT.to_string(),
      file_server_port: DEFAULT_FILE_SERVER_PORT,
      ca_dir: default_ca_dir(),
      ca_cert_file: CA_CERT_FILE.to_string(),
      ca_key_file: CA_KEY_FILE.to_string(),
      ca_validity: Duration::from_secs(365 * 24 * 60 * 60),
      leaf_validity: Duration::from_secs(60 * 60),
      organization: "mitmproxy".to_string(),
      sniff_timeout: Duration::from_secs(5),
      dial_timeout: Duration::from_secs(30),
      handshake_timeout: Duration::from_secs(30),
      socks_credentials: None,
      verify_upstream: true,
      tunnel_ip_hosts: true,
    }
  }
}

impl ProxyConfig {
  /// `host:port` the listener binds to
  pub fn listen_addr(&self) -> String {
    let port = if self.port.is_empty() {
      DEFAULT_PORT
    } else {
      self.port.as_str()
    };
    format!("{}:{}", self.host, port)
  }

  /// Full path of the root certificate
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca_dir.join(&self.ca_cert_file)
  }

  /// Full path of the root key
  pub fn ca_key_path(&self) -> PathBuf {
    self.ca_dir.join(&self.ca_key_file)
  }
}

fn default_ca_dir() -> PathBuf {
  dirs::home_dir()
    .unwrap_or_else(std::env::temp_dir)
    .join(".mitmproxy")
}
