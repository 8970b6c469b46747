//! Requests read from proxy clients

use super::{
  header_has_token, parse_version, read_body, read_headers, read_line, strip_hop_by_hop,
  version_str, write_headers, BodyLength, CR_LF, MAX_HEAD_SIZE, SPACE,
};
use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::{HeaderValue, ACCEPT_ENCODING, CONNECTION, HOST, UPGRADE};
use http::{HeaderMap, Method, Uri, Version};
use std::net::IpAddr;
use tokio::io::AsyncBufRead;

/// A parsed HTTP/1.x request with its body fully read
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub uri: Uri,
  pub version: Version,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl HttpRequest {
  /// Read the next request from `reader`.
  ///
  /// `Ok(None)` means the client closed the connection between requests.
  pub async fn read<R>(reader: &mut R) -> Result<Option<Self>>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut budget = MAX_HEAD_SIZE;
    let mut line = Vec::new();
    // tolerate stray CRLFs between pipelined requests
    loop {
      if read_line(reader, &mut line, &mut budget).await? == 0 {
        return Ok(None);
      }
      if line != b"\r\n" && line != b"\n" {
        break;
      }
    }
    let (method, uri, version) = parse_request_line(&line)?;
    let headers = read_headers(reader, &mut budget).await?;
    let body = if method == Method::CONNECT {
      Bytes::new()
    } else {
      let length = BodyLength::from_headers(&headers, BodyLength::Empty)?;
      read_body(reader, length).await?
    };
    Ok(Some(Self {
      method,
      uri,
      version,
      headers,
      body,
    }))
  }

  /// Target authority, `host[:port]`, from the URI or the Host header
  pub fn host(&self) -> String {
    if let Some(authority) = self.uri.authority() {
      return authority.as_str().to_string();
    }
    self
      .headers
      .get(HOST)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default()
      .to_string()
  }

  /// Target host without port or IPv6 brackets
  pub fn hostname(&self) -> String {
    split_host_port(&self.host()).0
  }

  /// Target port, `default` when the request names none
  pub fn port(&self, default: u16) -> u16 {
    split_host_port(&self.host()).1.unwrap_or(default)
  }

  /// Path and query, `/` when empty
  pub fn path(&self) -> String {
    self
      .uri
      .path_and_query()
      .map(|pq| pq.as_str().to_string())
      .filter(|pq| !pq.is_empty())
      .unwrap_or_else(|| "/".to_string())
  }

  /// True when the target host is an IP literal
  pub fn is_ip_host(&self) -> bool {
    self.hostname().parse::<IpAddr>().is_ok()
  }

  pub fn is_connect(&self) -> bool {
    self.method == Method::CONNECT
  }

  /// `Connection: upgrade` together with `Upgrade: websocket`
  pub fn is_websocket_upgrade(&self) -> bool {
    header_has_token(&self.headers, CONNECTION, "upgrade")
      && header_has_token(&self.headers, UPGRADE, "websocket")
  }

  /// True when the client does not want the connection reused
  pub fn wants_close(&self) -> bool {
    if header_has_token(&self.headers, CONNECTION, "close") {
      return true;
    }
    self.version == Version::HTTP_10 && !header_has_token(&self.headers, CONNECTION, "keep-alive")
  }

  /// Content-Type header value
  pub fn content_type(&self) -> String {
    self
      .headers
      .get(http::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default()
      .to_string()
  }

  /// Prepare the request for the origin.
  ///
  /// Strips hop-by-hop headers, makes the URI absolute under `scheme`,
  /// pins the Host header and narrows `Accept-Encoding` to gzip so the
  /// response body stays decodable. `default_host` fills in for requests
  /// that arrived in origin form without a Host header.
  pub fn normalize(&mut self, scheme: &str, default_host: &str) -> Result<()> {
    let mut authority = self.host();
    if authority.is_empty() {
      authority = default_host.to_string();
    }
    if authority.is_empty() {
      return Err(Error::invalid_request("Request names no host"));
    }
    strip_hop_by_hop(&mut self.headers);
    let path = self.path();
    self.uri = Uri::builder()
      .scheme(scheme)
      .authority(authority.as_str())
      .path_and_query(path.as_str())
      .build()?;
    self.headers.insert(
      HOST,
      HeaderValue::from_str(&authority).map_err(|e| Error::HttpError(e.into()))?,
    );
    if self.headers.contains_key(ACCEPT_ENCODING) {
      self
        .headers
        .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }
    Ok(())
  }

  /// Start line plus header block as sent
  pub fn head(&self) -> String {
    crate::body::head_text(
      &format!(
        "{} {} {}",
        self.method,
        self.uri,
        version_str(self.version)
      ),
      &self.headers,
    )
  }

  /// Wire bytes of the request.
  ///
  /// `origin_form` writes the path instead of the absolute URI. The body
  /// is always framed with Content-Length since it has been read whole.
  /// `close` appends `Connection: close`.
  pub fn to_raw(&self, origin_form: bool, close: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + self.body.len());
    buf.extend_from_slice(self.method.as_str().as_bytes());
    buf.extend_from_slice(SPACE);
    if origin_form {
      buf.extend_from_slice(self.path().as_bytes());
    } else {
      buf.extend_from_slice(self.uri.to_string().as_bytes());
    }
    buf.extend_from_slice(SPACE);
    buf.extend_from_slice(version_str(self.version).as_bytes());
    buf.extend_from_slice(CR_LF);
    let mut headers = self.headers.clone();
    headers.remove(http::header::TRANSFER_ENCODING);
    headers.remove(http::header::CONTENT_LENGTH);
    if close {
      headers.remove(CONNECTION);
      headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }
    if !self.body.is_empty() || matches!(self.method, Method::POST | Method::PUT | Method::PATCH) {
      headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    }
    write_headers(&mut buf, &headers);
    buf.extend_from_slice(CR_LF);
    buf.extend_from_slice(&self.body);
    buf
  }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, Uri, Version)> {
  let line = line.strip_suffix(CR_LF).unwrap_or(line);
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let mut parts = line.split(|b| *b == b' ').filter(|p| !p.is_empty());
  let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::invalid_request(format!(
      "Invalid request line: {}",
      line.escape_ascii()
    )));
  };
  let method = Method::from_bytes(method).map_err(|e| Error::HttpError(e.into()))?;
  let uri = Uri::try_from(target).map_err(|e| Error::HttpError(e.into()))?;
  let version = parse_version(version)?;
  Ok((method, uri, version))
}

/// Split `host[:port]`, accepting bracketed IPv6 literals
pub fn split_host_port(authority: &str) -> (String, Option<u16>) {
  if let Some(rest) = authority.strip_prefix('[') {
    if let Some((host, tail)) = rest.split_once(']') {
      let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
      return (host.to_string(), port);
    }
  }
  match authority.rsplit_once(':') {
    // a bare IPv6 literal has several colons and no port
    Some((host, port)) if !host.contains(':') => (host.to_string(), port.parse().ok()),
    _ => (authority.to_string(), None),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn parse(raw: &[u8]) -> HttpRequest {
    let mut reader = raw;
    HttpRequest::read(&mut reader).await.unwrap().unwrap()
  }

  #[tokio::test]
  async fn test_read_absolute_form() {
    let req = parse(b"GET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
    assert_eq!(req.method, Method::GET);
    assert_eq!(req.host(), "example.com");
    assert_eq!(req.hostname(), "example.com");
    assert_eq!(req.path(), "/a?b=1");
    assert_eq!(req.port(80), 80);
    assert!(!req.is_ip_host());
  }

  #[tokio::test]
  async fn test_read_connect() {
    let req = parse(b"CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n").await;
    assert!(req.is_connect());
    assert_eq!(req.hostname(), "example.org");
    assert_eq!(req.port(80), 443);
  }

  #[tokio::test]
  async fn test_read_eof_and_blank_lines() {
    let mut empty: &[u8] = b"";
    assert!(HttpRequest::read(&mut empty).await.unwrap().is_none());
    let req = parse(b"\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert_eq!(req.host(), "a");
  }

  #[tokio::test]
  async fn test_read_chunked_request_body() {
    let req = parse(
      b"POST http://a/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
    )
    .await;
    assert_eq!(&req.body[..], b"abc");
    let raw = String::from_utf8(req.to_raw(true, true)).unwrap();
    assert!(raw.starts_with("POST / HTTP/1.1\r\n"));
    assert!(raw.contains("content-length: 3\r\n"));
    assert!(raw.contains("connection: close\r\n"));
    assert!(!raw.contains("transfer-encoding"));
    assert!(raw.ends_with("\r\n\r\nabc"));
  }

  #[tokio::test]
  async fn test_normalize() {
    let mut req = parse(
      b"GET /x HTTP/1.1\r\nHost: example.com:8080\r\nProxy-Connection: keep-alive\r\nAccept-Encoding: br, deflate\r\n\r\n",
    )
    .await;
    req.normalize("https", "fallback").unwrap();
    assert_eq!(req.uri.to_string(), "https://example.com:8080/x");
    assert!(!req.headers.contains_key("proxy-connection"));
    assert_eq!(req.headers[ACCEPT_ENCODING], "gzip");
    assert_eq!(req.headers[HOST], "example.com:8080");
  }

  #[tokio::test]
  async fn test_websocket_upgrade_detection() {
    let req = parse(
      b"GET /ws HTTP/1.1\r\nHost: a\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n",
    )
    .await;
    assert!(req.is_websocket_upgrade());
  }

  #[test]
  fn test_split_host_port() {
    assert_eq!(split_host_port("a.com:81"), ("a.com".to_string(), Some(81)));
    assert_eq!(split_host_port("a.com"), ("a.com".to_string(), None));
    assert_eq!(split_host_port("[::1]:8080"), ("::1".to_string(), Some(8080)));
    assert_eq!(split_host_port("::1"), ("::1".to_string(), None));
  }

  #[tokio::test]
  async fn test_ip_host() {
    let req = parse(b"GET http://10.1.2.3:9000/ HTTP/1.1\r\n\r\n").await;
    assert!(req.is_ip_host());
    assert_eq!(req.port(80), 9000);
  }
}
