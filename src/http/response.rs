//! Responses read from origins and written back to clients

use super::{
  parse_version, read_body, read_headers, read_line, strip_hop_by_hop, version_str, write_headers,
  BodyLength, CR_LF, MAX_HEAD_SIZE, SPACE,
};
use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode, Version};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::io::AsyncBufRead;

/// A parsed HTTP/1.x response with its body fully read
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub version: Version,
  pub status: StatusCode,
  /// Reason phrase as the origin sent it
  pub reason: String,
  pub headers: HeaderMap,
  pub body: Bytes,
  /// Answer to a HEAD request; its framing headers describe a body that
  /// was never sent
  pub head_only: bool,
}

impl HttpResponse {
  /// Read the final response to a `method` request.
  ///
  /// Interim 1xx responses are skipped, except `101 Switching Protocols`
  /// which ends the exchange.
  pub async fn read<R>(reader: &mut R, method: &Method) -> Result<Self>
  where
    R: AsyncBufRead + Unpin,
  {
    loop {
      let mut budget = MAX_HEAD_SIZE;
      let (version, status, reason) = parser_version(reader, &mut budget).await?;
      let headers = read_headers(reader, &mut budget).await?;
      if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!("Skipping interim response {}", status);
        continue;
      }
      let head_only = *method == Method::HEAD;
      let no_body = head_only
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;
      let body = if no_body {
        Bytes::new()
      } else {
        let length = BodyLength::from_headers(&headers, BodyLength::UntilEof)?;
        read_body(reader, length).await?
      };
      return Ok(Self {
        version,
        status,
        reason,
        headers,
        body,
        head_only,
      });
    }
  }

  /// Response with an empty body and `Connection: close`
  pub fn simple(status: StatusCode) -> Self {
    let mut headers = HeaderMap::new();
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    Self {
      version: Version::HTTP_11,
      status,
      reason: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: Bytes::new(),
      head_only: false,
    }
  }

  /// `502 Bad Gateway` describing a failed round trip
  pub fn bad_gateway(err: &str) -> Self {
    let mut response = Self::simple(StatusCode::BAD_GATEWAY);
    let date = OffsetDateTime::now_utc()
      .format(format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
      ))
      .unwrap_or_default();
    let warning = format!(
      "199 \"mitmproxy\" \"{}\" \"{}\"",
      err.replace(['"', '\r', '\n'], " "),
      date
    );
    if let Ok(value) = HeaderValue::from_str(&warning) {
      response.headers.insert(http::header::WARNING, value);
    }
    response
  }

  /// Status code and reason, e.g. `200 OK`
  pub fn status_text(&self) -> String {
    let reason = if self.reason.is_empty() {
      self.status.canonical_reason().unwrap_or_default()
    } else {
      self.reason.as_str()
    };
    format!("{} {}", self.status.as_u16(), reason)
      .trim_end()
      .to_string()
  }

  /// Content-Type header value
  pub fn content_type(&self) -> String {
    self
      .headers
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default()
      .to_string()
  }

  /// Status line plus header block
  pub fn head(&self) -> String {
    crate::body::head_text(
      &format!("{} {}", version_str(self.version), self.status_text()),
      &self.headers,
    )
  }

  /// Wire bytes for the client.
  ///
  /// Hop-by-hop headers are dropped and a read body is framed with
  /// Content-Length. HEAD and `304` answers keep the origin's length, 1xx
  /// and `204` carry none. `close` announces that the proxy will hang up.
  pub fn to_raw(&self, close: bool) -> Vec<u8> {
    let version = match self.version {
      Version::HTTP_09 | Version::HTTP_10 => Version::HTTP_10,
      _ => Version::HTTP_11,
    };
    let mut buf = Vec::with_capacity(256 + self.body.len());
    buf.extend_from_slice(version_str(version).as_bytes());
    buf.extend_from_slice(SPACE);
    buf.extend_from_slice(self.status_text().as_bytes());
    buf.extend_from_slice(CR_LF);
    let mut headers = self.headers.clone();
    strip_hop_by_hop(&mut headers);
    if close {
      headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }
    if self.status.is_informational() || self.status == StatusCode::NO_CONTENT {
      headers.remove(CONTENT_LENGTH);
    } else if !self.head_only && self.status != StatusCode::NOT_MODIFIED {
      headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    }
    write_headers(&mut buf, &headers);
    buf.extend_from_slice(CR_LF);
    buf.extend_from_slice(&self.body);
    buf
  }
}

async fn parser_version<R>(
  reader: &mut R,
  budget: &mut usize,
) -> Result<(Version, StatusCode, String)>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  if read_line(reader, &mut line, budget).await? == 0 {
    return Err(
      std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "origin closed before sending a response",
      )
      .into(),
    );
  }
  let line = line.strip_suffix(CR_LF).unwrap_or(&line);
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let mut parts = line.splitn(3, |b| b == &b' ');
  let version = parse_version(parts.next().unwrap_or_default())?;
  let status = parts
    .next()
    .filter(|s| !s.is_empty())
    .ok_or_else(|| Error::invalid_request("Status line without status code"))
    .and_then(|s| StatusCode::from_bytes(s).map_err(|e| Error::HttpError(e.into())))?;
  let reason = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
  Ok((version, status, reason))
}
