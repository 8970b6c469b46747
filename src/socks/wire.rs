//! SOCKS4/4a and SOCKS5 message layouts (RFC 1928, RFC 1929)
//!
//! Every message has a `to_bytes` encoder and an async `read_from`
//! decoder that pulls exactly the bytes the message occupies, so the
//! stream can be handed to the tunnel right after the handshake.

use crate::error::{Error, ReplyError, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

#[rustfmt::skip]
pub mod consts {
  pub const SOCKS4_VERSION: u8 = 0x04;
  pub const SOCKS4_REPLY_VERSION: u8 = 0x00;
  pub const SOCKS4_STATUS_GRANTED: u8 = 0x5a;
  pub const SOCKS4_STATUS_REJECTED: u8 = 0x5b;

  pub const SOCKS5_VERSION: u8 = 0x05;
  pub const SOCKS5_AUTH_VERSION: u8 = 0x01;

  pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
  pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
  pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xff;

  pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;
  pub const SOCKS5_CMD_TCP_BIND: u8 = 0x02;
  pub const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

  pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

  pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
  pub const SOCKS5_AUTH_SUCCEEDED: u8 = 0x00;
  pub const SOCKS5_AUTH_FAILED: u8 = 0x01;

  /// Longest user id, domain name, username or password accepted
  pub const MAX_FIELD_LEN: usize = 255;
}

use consts::*;

/// Destination of a SOCKS request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  /// IPv4 or IPv6 socket address
  Ip(SocketAddr),
  /// Domain name resolved by the proxy
  Domain(String, u16),
}

impl TargetAddr {
  /// Host part without brackets
  pub fn host(&self) -> String {
    match self {
      TargetAddr::Ip(addr) => addr.ip().to_string(),
      TargetAddr::Domain(domain, _) => domain.clone(),
    }
  }

  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ip(addr) => addr.port(),
      TargetAddr::Domain(_, port) => *port,
    }
  }

  /// Resolve to the first socket address
  pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
    match self {
      TargetAddr::Ip(addr) => Ok(*addr),
      TargetAddr::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
        .await?
        .next()
        .ok_or_else(|| {
          std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} resolved to no addresses", domain),
          )
        }),
    }
  }
}

impl fmt::Display for TargetAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TargetAddr::Ip(addr) => write!(f, "{}", addr),
      TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
    }
  }
}

impl FromStr for TargetAddr {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
      return Ok(TargetAddr::Ip(addr));
    }
    let (host, port) = s
      .rsplit_once(':')
      .ok_or_else(|| Error::invalid_request(format!("Missing port in {}", s)))?;
    let port = port
      .parse()
      .map_err(|_| Error::invalid_request(format!("Invalid port in {}", s)))?;
    Ok(TargetAddr::Domain(host.to_string(), port))
  }
}

impl From<SocketAddr> for TargetAddr {
  fn from(addr: SocketAddr) -> Self {
    TargetAddr::Ip(addr)
  }
}

/// Request command shared by both protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  Connect,
  Bind,
  Associate,
  Unknown(u8),
}

impl From<u8> for Command {
  fn from(value: u8) -> Self {
    match value {
      SOCKS5_CMD_TCP_CONNECT => Command::Connect,
      SOCKS5_CMD_TCP_BIND => Command::Bind,
      SOCKS5_CMD_UDP_ASSOCIATE => Command::Associate,
      other => Command::Unknown(other),
    }
  }
}

impl From<Command> for u8 {
  fn from(value: Command) -> Self {
    match value {
      Command::Connect => SOCKS5_CMD_TCP_CONNECT,
      Command::Bind => SOCKS5_CMD_TCP_BIND,
      Command::Associate => SOCKS5_CMD_UDP_ASSOCIATE,
      Command::Unknown(other) => other,
    }
  }
}

/// SOCKS5 authentication method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
  NotRequired,
  UsernamePassword,
  NoAcceptableMethods,
  Other(u8),
}

impl From<u8> for AuthMethod {
  fn from(value: u8) -> Self {
    match value {
      SOCKS5_AUTH_METHOD_NONE => AuthMethod::NotRequired,
      SOCKS5_AUTH_METHOD_PASSWORD => AuthMethod::UsernamePassword,
      SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE => AuthMethod::NoAcceptableMethods,
      other => AuthMethod::Other(other),
    }
  }
}

impl From<AuthMethod> for u8 {
  fn from(value: AuthMethod) -> Self {
    match value {
      AuthMethod::NotRequired => SOCKS5_AUTH_METHOD_NONE,
      AuthMethod::UsernamePassword => SOCKS5_AUTH_METHOD_PASSWORD,
      AuthMethod::NoAcceptableMethods => SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
      AuthMethod::Other(other) => other,
    }
  }
}

async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
  Ok(reader.read_u8().await?)
}

async fn read_port<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u16> {
  Ok(reader.read_u16().await?)
}

fn check_version(expected: u8, got: u8) -> Result<()> {
  if expected != got {
    return Err(Error::proxy_error(format!(
      "Unsupported SOCKS version {:#04x}, expected {:#04x}",
      got, expected
    )));
  }
  Ok(())
}

/// NUL terminated string, at most [`MAX_FIELD_LEN`] bytes
async fn read_cstring<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
  let mut buf = Vec::new();
  loop {
    let byte = read_u8(reader).await?;
    if byte == 0 {
      break;
    }
    if buf.len() == MAX_FIELD_LEN {
      return Err(Error::invalid_request("SOCKS4 string field too long"));
    }
    buf.push(byte);
  }
  String::from_utf8(buf).map_err(|_| Error::invalid_request("SOCKS4 string field is not UTF-8"))
}

/// One length-prefixed field of at most 255 bytes
async fn read_field<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
  let len = read_u8(reader).await? as usize;
  let mut buf = vec![0u8; len];
  reader.read_exact(&mut buf).await?;
  String::from_utf8(buf).map_err(|_| Error::invalid_request("SOCKS5 string field is not UTF-8"))
}

fn push_field(buf: &mut Vec<u8>, field: &str) -> Result<()> {
  let len = u8::try_from(field.len()).map_err(|_| {
    Error::invalid_request(format!(
      "Field of {} bytes does not fit a SOCKS message",
      field.len()
    ))
  })?;
  buf.push(len);
  buf.extend_from_slice(field.as_bytes());
  Ok(())
}

/// `ATYP ADDR PORT` as used by SOCKS5 requests and replies
fn push_addr(buf: &mut Vec<u8>, addr: &TargetAddr) -> Result<()> {
  match addr {
    TargetAddr::Ip(SocketAddr::V4(addr)) => {
      buf.push(SOCKS5_ADDR_TYPE_IPV4);
      buf.extend_from_slice(&addr.ip().octets());
    }
    TargetAddr::Ip(SocketAddr::V6(addr)) => {
      buf.push(SOCKS5_ADDR_TYPE_IPV6);
      buf.extend_from_slice(&addr.ip().octets());
    }
    TargetAddr::Domain(domain, _) => {
      buf.push(SOCKS5_ADDR_TYPE_DOMAIN_NAME);
      push_field(buf, domain)?;
    }
  }
  buf.extend_from_slice(&addr.port().to_be_bytes());
  Ok(())
}

async fn read_addr<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TargetAddr> {
  let addr = match read_u8(reader).await? {
    SOCKS5_ADDR_TYPE_IPV4 => {
      let mut ip = [0u8; 4];
      reader.read_exact(&mut ip).await?;
      TargetAddr::Ip(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::from(ip)),
        read_port(reader).await?,
      ))
    }
    SOCKS5_ADDR_TYPE_IPV6 => {
      let mut ip = [0u8; 16];
      reader.read_exact(&mut ip).await?;
      TargetAddr::Ip(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::from(ip)),
        read_port(reader).await?,
      ))
    }
    SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
      let domain = read_field(reader).await?;
      TargetAddr::Domain(domain, read_port(reader).await?)
    }
    other => {
      tracing::debug!("Unsupported SOCKS5 address type {:#04x}", other);
      return Err(ReplyError::AddressTypeNotSupported.into());
    }
  };
  Ok(addr)
}

/// `VER CMD DSTPORT DSTIP USERID NUL [DOMAIN NUL]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4Request {
  pub command: Command,
  /// IPv4 address, or a domain name for SOCKS4a
  pub addr: TargetAddr,
  pub user_id: String,
}

impl Socks4Request {
  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    let mut buf = vec![SOCKS4_VERSION, self.command.into()];
    buf.extend_from_slice(&self.addr.port().to_be_bytes());
    match &self.addr {
      TargetAddr::Ip(SocketAddr::V4(addr)) => buf.extend_from_slice(&addr.ip().octets()),
      TargetAddr::Ip(SocketAddr::V6(addr)) => {
        return Err(Error::invalid_request(format!(
          "SOCKS4 cannot carry IPv6 address {}",
          addr
        )))
      }
      // 0.0.0.x with x != 0 marks a SOCKS4a request
      TargetAddr::Domain(..) => buf.extend_from_slice(&[0, 0, 0, 1]),
    }
    buf.extend_from_slice(self.user_id.as_bytes());
    buf.push(0);
    if let TargetAddr::Domain(domain, _) = &self.addr {
      buf.extend_from_slice(domain.as_bytes());
      buf.push(0);
    }
    Ok(buf)
  }

  pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
    check_version(SOCKS4_VERSION, read_u8(reader).await?)?;
    let command = Command::from(read_u8(reader).await?);
    let port = read_port(reader).await?;
    let mut ip = [0u8; 4];
    reader.read_exact(&mut ip).await?;
    let user_id = read_cstring(reader).await?;
    let addr = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
      TargetAddr::Domain(read_cstring(reader).await?, port)
    } else {
      TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
    };
    Ok(Self {
      command,
      addr,
      user_id,
    })
  }
}

/// `VN CD DSTPORT DSTIP`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4Response {
  pub granted: bool,
  /// Bound address for BIND replies, unspecified otherwise
  pub addr: SocketAddrV4,
}

impl Socks4Response {
  pub fn granted(addr: SocketAddrV4) -> Self {
    Self {
      granted: true,
      addr,
    }
  }

  pub fn rejected() -> Self {
    Self {
      granted: false,
      addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
    }
  }

  pub fn to_bytes(&self) -> Vec<u8> {
    let status = if self.granted {
      SOCKS4_STATUS_GRANTED
    } else {
      SOCKS4_STATUS_REJECTED
    };
    let mut buf = vec![SOCKS4_REPLY_VERSION, status];
    buf.extend_from_slice(&self.addr.port().to_be_bytes());
    buf.extend_from_slice(&self.addr.ip().octets());
    buf
  }

  pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
    check_version(SOCKS4_REPLY_VERSION, read_u8(reader).await?)?;
    let granted = read_u8(reader).await? == SOCKS4_STATUS_GRANTED;
    let port = read_port(reader).await?;
    let mut ip = [0u8; 4];
    reader.read_exact(&mut ip).await?;
    Ok(Self {
      granted,
      addr: SocketAddrV4::new(Ipv4Addr::from(ip), port),
    })
  }
}

/// `VER NMETHODS METHODS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSelectRequest {
  pub methods: Vec<AuthMethod>,
}

impl MethodSelectRequest {
  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    let count = u8::try_from(self.methods.len()).map_err(|_| {
      Error::invalid_request(format!("{} methods do not fit a SOCKS5 greeting", self.methods.len()))
    })?;
    let mut buf = vec![SOCKS5_VERSION, count];
    buf.extend(self.methods.iter().map(|m| u8::from(*m)));
    Ok(buf)
  }

  pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
    check_version(SOCKS5_VERSION, read_u8(reader).await?)?;
    let count = read_u8(reader).await? as usize;
    let mut methods = vec![0u8; count];
    reader.read_exact(&mut methods).await?;
    Ok(Self {
      methods: methods.into_iter().map(AuthMethod::from).collect(),
    })
  }
}

/// `VER METHOD`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSelectResponse {
  pub method: AuthMethod,
}

impl MethodSelectResponse {
  pub fn to_bytes(&self) -> Vec<u8> {
    vec![SOCKS5_VERSION, self.method.into()]
  }

  pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
    check_version(SOCKS5_VERSION, read_u8(reader).await?)?;
    Ok(Self {
      method: AuthMethod::from(read_u8(reader).await?),
    })
  }
}

/// `VER ULEN UNAME PLEN PASSWD`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernamePasswordAuthRequest {
  pub username: String,
  pub password: String,
}

impl UsernamePasswordAuthRequest {
  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    let mut buf = vec![SOCKS5_AUTH_VERSION];
    push_field(&mut buf, &self.username)?;
    push_field(&mut buf, &self.password)?;
    Ok(buf)
  }

  pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
    check_version(SOCKS5_AUTH_VERSION, read_u8(reader).await?)?;
    let username = read_field(reader).await?;
    let password = read_field(reader).await?;
    Ok(Self { username, password })
  }
}

/// `VER STATUS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsernamePasswordAuthResponse {
  pub success: bool,
}

impl UsernamePasswordAuthResponse {
  pub fn to_bytes(&self) -> Vec<u8> {
    let status = if self.success {
      SOCKS5_AUTH_SUCCEEDED
    } else {
      SOCKS5_AUTH_FAILED
    };
    vec![SOCKS5_AUTH_VERSION, status]
  }

  pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
    check_version(SOCKS5_AUTH_VERSION, read_u8(reader).await?)?;
    Ok(Self {
      success: read_u8(reader).await? == SOCKS5_AUTH_SUCCEEDED,
    })
  }
}

/// `VER CMD RSV ATYP DST.ADDR DST.PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
  pub command: Command,
  pub addr: TargetAddr,
}

impl Socks5Request {
  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    let mut buf = vec![SOCKS5_VERSION, self.command.into(), 0x00];
    push_addr(&mut buf, &self.addr)?;
    Ok(buf)
  }

  /// An unknown address type fails with [`ReplyError::AddressTypeNotSupported`]
  pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
    check_version(SOCKS5_VERSION, read_u8(reader).await?)?;
    let command = Command::from(read_u8(reader).await?);
    let _reserved = read_u8(reader).await?;
    let addr = read_addr(reader).await?;
    Ok(Self { command, addr })
  }
}

/// `VER REP RSV ATYP BND.ADDR BND.PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Response {
  /// `None` when the request succeeded
  pub error: Option<ReplyError>,
  pub addr: TargetAddr,
}

impl Socks5Response {
  pub fn granted(addr: impl Into<TargetAddr>) -> Self {
    Self {
      error: None,
      addr: addr.into(),
    }
  }

  pub fn rejected(error: ReplyError) -> Self {
    Self {
      error: Some(error),
      addr: TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
    }
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    let reply = self
      .error
      .map(|e| e.code())
      .unwrap_or(SOCKS5_REPLY_SUCCEEDED);
    let mut buf = vec![SOCKS5_VERSION, reply, 0x00];
    push_addr(&mut buf, &self.addr)?;
    Ok(buf)
  }

  pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
    check_version(SOCKS5_VERSION, read_u8(reader).await?)?;
    let error = ReplyError::from_code(read_u8(reader).await?);
    let _reserved = read_u8(reader).await?;
    let addr = read_addr(reader).await?;
    Ok(Self { error, addr })
  }
}
