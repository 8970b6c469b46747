//! HTTP/1.x plumbing: message parsing, origin connections and the handler

pub mod connector;
pub mod handler;
pub mod request;
pub mod response;

pub use connector::{Connector, MaybeTlsStream};
pub use handler::HttpHandler;
pub use request::HttpRequest;
pub use response::HttpResponse;

use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];

/// Upper bound on a start line plus header block
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound on a decoded chunked body
pub(crate) const MAX_CHUNKED_BODY_SIZE: u64 = 256 * 1024 * 1024;

/// Headers that describe the connection rather than the message
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let listed: Vec<String> = headers
    .get_all(http::header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase())
    .filter(|t| !t.is_empty())
    .collect();
  for name in listed {
    headers.remove(name.as_str());
  }
  for name in HOP_BY_HOP_HEADERS {
    headers.remove(*name);
  }
}

/// True when a comma separated header contains `token`
pub(crate) fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
  headers
    .get_all(name)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Read one line into `line`, charging it against `budget`
pub(crate) async fn read_line<R>(
  reader: &mut R,
  line: &mut Vec<u8>,
  budget: &mut usize,
) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  line.clear();
  let n = (&mut *reader).take(*budget as u64).read_until(b'\n', line).await?;
  *budget = budget.saturating_sub(n);
  if n > 0 && !line.ends_with(b"\n") && *budget == 0 {
    return Err(Error::invalid_request("Header block too large"));
  }
  Ok(n)
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  let mut parts = buffer.splitn(2, |s| s == &b':');
  let name = parts.next().unwrap_or_default();
  let value = parts.next().ok_or_else(|| {
    Error::invalid_request(format!("Malformed header line: {}", buffer.escape_ascii()))
  })?;
  let value = value.trim_ascii();
  let name = HeaderName::from_bytes(name).map_err(|e| Error::HttpError(e.into()))?;
  let value = HeaderValue::from_bytes(value).map_err(|e| Error::HttpError(e.into()))?;
  Ok((name, value))
}

/// Read a header block up to and including the blank line
pub(crate) async fn read_headers<R>(reader: &mut R, budget: &mut usize) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  loop {
    let length = read_line(reader, &mut header_line, budget).await?;
    if length == 0 {
      return Err(Error::invalid_request("Connection closed inside header block"));
    }
    if header_line == b"\r\n" || header_line == b"\n" {
      break;
    }
    let (k, v) = parser_headers(&header_line)?;
    headers.append(k, v);
  }
  Ok(headers)
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
  Empty,
  Fixed(u64),
  Chunked,
  UntilEof,
}

impl BodyLength {
  /// Framing from headers, `fallback` when neither length header is present
  pub(crate) fn from_headers(headers: &HeaderMap, fallback: BodyLength) -> Result<Self> {
    if header_has_token(headers, http::header::TRANSFER_ENCODING, "chunked") {
      return Ok(BodyLength::Chunked);
    }
    match headers.get(http::header::CONTENT_LENGTH) {
      Some(v) => {
        let len = v
          .to_str()
          .ok()
          .and_then(|s| s.trim().parse::<u64>().ok())
          .ok_or_else(|| Error::invalid_request("Invalid Content-Length"))?;
        Ok(if len == 0 {
          BodyLength::Empty
        } else {
          BodyLength::Fixed(len)
        })
      }
      None => Ok(fallback),
    }
  }
}

/// Read a body framed as `length`
pub(crate) async fn read_body<R>(reader: &mut R, length: BodyLength) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  match length {
    BodyLength::Empty => Ok(Bytes::new()),
    BodyLength::Fixed(len) => {
      let mut body = Vec::with_capacity(len.min(1 << 20) as usize);
      let n = (&mut *reader).take(len).read_to_end(&mut body).await?;
      if (n as u64) < len {
        return Err(
          std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "body shorter than Content-Length")
            .into(),
        );
      }
      Ok(body.into())
    }
    BodyLength::Chunked => read_chunked_body(reader).await,
    BodyLength::UntilEof => {
      let mut body = Vec::new();
      reader.read_to_end(&mut body).await?;
      Ok(body.into())
    }
  }
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    let mut budget = MAX_HEAD_SIZE;
    if read_line(reader, &mut line, &mut budget).await? == 0 {
      return Err(Error::invalid_request("Connection closed inside chunked body"));
    }
    let text = String::from_utf8_lossy(&line);
    let size = text.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
      continue;
    }
    let size = u64::from_str_radix(size, 16)
      .map_err(|_| Error::invalid_request(format!("Invalid chunk size {:?}", size)))?;
    if size == 0 {
      // trailers end at the first blank line
      loop {
        let mut budget = MAX_HEAD_SIZE;
        let n = read_line(reader, &mut line, &mut budget).await?;
        if n == 0 || line == b"\r\n" || line == b"\n" {
          break;
        }
      }
      break;
    }
    (body.len() as u64)
      .checked_add(size)
      .filter(|total| *total <= MAX_CHUNKED_BODY_SIZE)
      .ok_or_else(|| {
        Error::invalid_request(format!(
          "Chunked body exceeds {} bytes",
          MAX_CHUNKED_BODY_SIZE
        ))
      })?;
    let n = (&mut *reader).take(size).read_to_end(&mut body).await?;
    if (n as u64) < size {
      return Err(
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "chunk shorter than its size")
          .into(),
      );
    }
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
  Ok(body.into())
}

/// Append `name: value\r\n` lines for every header
pub(crate) fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
  for (k, v) in headers {
    buf.extend_from_slice(k.as_str().as_bytes());
    buf.extend_from_slice(COLON_SPACE);
    buf.extend_from_slice(v.as_bytes());
    buf.extend_from_slice(CR_LF);
  }
}

pub(crate) fn version_str(version: http::Version) -> &'static str {
  match version {
    http::Version::HTTP_09 => "HTTP/0.9",
    http::Version::HTTP_10 => "HTTP/1.0",
    http::Version::HTTP_2 => "HTTP/2.0",
    http::Version::HTTP_3 => "HTTP/3.0",
    _ => "HTTP/1.1",
  }
}

pub(crate) fn parse_version(raw: &[u8]) -> Result<http::Version> {
  match raw {
    b"HTTP/0.9" => Ok(http::Version::HTTP_09),
    b"HTTP/1.0" => Ok(http::Version::HTTP_10),
    b"HTTP/1.1" => Ok(http::Version::HTTP_11),
    b"HTTP/2.0" | b"HTTP/2" => Ok(http::Version::HTTP_2),
    _ => Err(Error::invalid_request(format!(
      "Invalid HTTP version {:?}",
      String::from_utf8_lossy(raw)
    ))),
  }
}
