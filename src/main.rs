//! Command line entry point: runs the proxy and the root certificate endpoint

use clap::Parser;
use mitmproxy::config::{
  ProxyConfig, CA_CERT_FILE, CA_KEY_FILE, DEFAULT_FILE_SERVER_PORT, DEFAULT_PORT,
};
use mitmproxy::{CertServer, Proxy};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Parse a humantime duration ("5s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
  if let Ok(d) = humantime::parse_duration(s) {
    return Ok(d);
  }
  s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
    format!(
      "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
      s
    )
  })
}

/// Interactive HTTP(S), WebSocket and SOCKS man-in-the-middle proxy
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Cli {
  /// Interface to listen on
  #[arg(long, env = "MITM_HOST", default_value = "127.0.0.1")]
  host: String,

  /// Proxy port
  #[arg(short, long, env = "MITM_PORT", default_value = DEFAULT_PORT)]
  port: String,

  /// Port of the root certificate download endpoint
  #[arg(long, env = "MITM_FILE_SERVER_PORT", default_value_t = DEFAULT_FILE_SERVER_PORT)]
  file_server_port: u16,

  /// Directory holding the root certificate and key [default: ~/.mitmproxy]
  #[arg(long, env = "MITM_CA_DIR")]
  ca_dir: Option<PathBuf>,

  /// Root certificate file name
  #[arg(long, env = "MITM_CA_CERT_FILE", default_value = CA_CERT_FILE)]
  ca_cert_file: String,

  /// Root key file name
  #[arg(long, env = "MITM_CA_KEY_FILE", default_value = CA_KEY_FILE)]
  ca_key_file: String,

  /// Root certificate validity (e.g. "365d")
  #[arg(long, env = "MITM_CA_VALIDITY", default_value = "365d", value_parser = parse_duration)]
  ca_validity: Duration,

  /// Leaf certificate validity (e.g. "1h")
  #[arg(long, env = "MITM_LEAF_VALIDITY", default_value = "1h", value_parser = parse_duration)]
  leaf_validity: Duration,

  /// Organization written into issued certificates
  #[arg(long, env = "MITM_ORGANIZATION", default_value = "mitmproxy")]
  organization: String,

  /// Deadline for a client's first bytes
  #[arg(long, env = "MITM_SNIFF_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
  sniff_timeout: Duration,

  /// Connect timeout for origins
  #[arg(long, env = "MITM_DIAL_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
  dial_timeout: Duration,

  /// TLS handshake timeout
  #[arg(long, env = "MITM_HANDSHAKE_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
  handshake_timeout: Duration,

  /// Username SOCKS5 clients must present
  #[arg(long, env = "MITM_SOCKS_USER", requires = "socks_pass")]
  socks_user: Option<String>,

  /// Password SOCKS5 clients must present
  #[arg(long, env = "MITM_SOCKS_PASS", requires = "socks_user")]
  socks_pass: Option<String>,

  /// Accept any origin certificate
  #[arg(long, env = "MITM_INSECURE")]
  insecure: bool,

  /// Intercept requests for bare IP hosts instead of tunnelling them
  #[arg(long, env = "MITM_NO_IP_TUNNEL")]
  no_ip_tunnel: bool,

  /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
  #[arg(long, env = "MITM_LOG_LEVEL", default_value = "info")]
  log_level: String,
}

impl Cli {
  fn into_config(self) -> ProxyConfig {
    let defaults = ProxyConfig::default();
    ProxyConfig {
      host: self.host,
      port: self.port,
      file_server_port: self.file_server_port,
      ca_dir: self.ca_dir.unwrap_or(defaults.ca_dir),
      ca_cert_file: self.ca_cert_file,
      ca_key_file: self.ca_key_file,
      ca_validity: self.ca_validity,
      leaf_validity: self.leaf_validity,
      organization: self.organization,
      sniff_timeout: self.sniff_timeout,
      dial_timeout: self.dial_timeout,
      handshake_timeout: self.handshake_timeout,
      socks_credentials: self.socks_user.zip(self.socks_pass),
      verify_upstream: !self.insecure,
      tunnel_ip_hosts: !self.no_ip_tunnel,
    }
  }
}

fn init_logger(level: &str) {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("mitmproxy={}", level)));
  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .compact(),
    )
    .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let cli = Cli::parse();
  init_logger(&cli.log_level);
  let config = cli.into_config();
  let (host, file_server_port) = (config.host.clone(), config.file_server_port);
  let proxy = Proxy::new(config, None).await?;
  let cert_server = CertServer::new(proxy.authority(), &host, file_server_port);
  tracing::info!(
    "Root certificate stored at {}",
    proxy.authority().cert_path().display()
  );
  tokio::try_join!(proxy.listen_and_serve(), cert_server.listen_and_serve())?;
  Ok(())
}
