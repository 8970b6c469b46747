//! Payload renderings attached to session records

use crate::session::BodyDecoder;
#[cfg(feature = "charset")]
use encoding_rs::{Encoding, UTF_8};
#[cfg(feature = "gzip")]
use flate2::read::MultiGzDecoder;
use http::HeaderMap;
#[cfg(feature = "charset")]
use mime::Mime;
use std::borrow::Cow;
use std::fmt::Write;
#[cfg(feature = "gzip")]
use std::io::Read;

/// Canonical hex dump: offset, sixteen bytes split in two groups, ASCII column.
///
/// ```
/// assert_eq!(
///   mitmproxy::body::hex_dump(b"GET / HTTP/1.1\r\n"),
///   "00000000  47 45 54 20 2f 20 48 54  54 50 2f 31 2e 31 0d 0a  |GET / HTTP/1.1..|\n"
/// );
/// ```
pub fn hex_dump(data: &[u8]) -> String {
  let mut out = String::with_capacity(data.len() / 16 * 79 + 79);
  for (row, chunk) in data.chunks(16).enumerate() {
    let _ = write!(out, "{:08x}  ", row * 16);
    for i in 0..16 {
      match chunk.get(i) {
        Some(b) => {
          let _ = write!(out, "{:02x} ", b);
        }
        None => out.push_str("   "),
      }
      if i == 7 {
        out.push(' ');
      }
    }
    out.push_str(" |");
    for &b in chunk {
      out.push(if (0x20..=0x7e).contains(&b) { b as char } else { '.' });
    }
    out.push_str("|\n");
  }
  out
}

fn header_str<'a>(headers: &'a HeaderMap, name: http::header::HeaderName) -> &'a str {
  headers
    .get(name)
    .and_then(|v| v.to_str().ok())
    .unwrap_or_default()
}

/// Body with any gzip content encoding removed.
///
/// A body that fails to inflate is returned unchanged.
pub fn decompress<'a>(headers: &HeaderMap, body: &'a [u8]) -> Cow<'a, [u8]> {
  #[cfg(feature = "gzip")]
  if header_str(headers, http::header::CONTENT_ENCODING).eq_ignore_ascii_case("gzip") {
    let mut inflated = Vec::new();
    let mut d = MultiGzDecoder::new(body);
    match d.read_to_end(&mut inflated) {
      Ok(_) => return Cow::Owned(inflated),
      Err(e) => tracing::debug!("Body is not valid gzip: {}", e),
    }
  }
  #[cfg(not(feature = "gzip"))]
  let _ = headers;
  Cow::Borrowed(body)
}

/// Decode `body` with the charset named in `Content-Type`, UTF-8 otherwise
#[cfg(feature = "charset")]
pub fn decode_text(headers: &HeaderMap, body: &[u8]) -> String {
  let content_type = header_str(headers, http::header::CONTENT_TYPE)
    .parse::<Mime>()
    .ok();
  let label = content_type
    .as_ref()
    .and_then(|mime| mime.get_param("charset").map(|charset| charset.as_str()))
    .unwrap_or("utf-8");
  let encoding = Encoding::for_label(label.as_bytes()).unwrap_or(UTF_8);
  let (text, _, _) = encoding.decode(body);
  text.into_owned()
}

/// Decode `body` as UTF-8, replacing invalid sequences
#[cfg(not(feature = "charset"))]
pub fn decode_text(_headers: &HeaderMap, body: &[u8]) -> String {
  String::from_utf8_lossy(body).into_owned()
}

/// Kind of rendering a content type selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
  Json,
  Html,
  JavaScript,
  Text,
  Binary,
}

impl BodyKind {
  /// Pick a rendering from a `Content-Type` value
  pub fn from_content_type(content_type: &str) -> Self {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("json") {
      BodyKind::Json
    } else if ct.contains("html") {
      BodyKind::Html
    } else if ct.contains("javascript") || ct.contains("ecmascript") {
      BodyKind::JavaScript
    } else if ct.starts_with("text/") || ct.contains("xml") || ct.contains("x-www-form-urlencoded") {
      BodyKind::Text
    } else {
      BodyKind::Binary
    }
  }
}

/// Fill `decoder` with the payload and every rendering `headers` allow.
///
/// `head` is the serialised start line and header block; the http dump is
/// the head, a blank line and the first non-empty rendering.
pub fn fill_decoder(decoder: &mut BodyDecoder, head: &str, headers: &HeaderMap, body: &[u8]) {
  decoder.set_payload(body);
  let plain = decompress(headers, body);
  if !plain.is_empty() {
    match BodyKind::from_content_type(header_str(headers, http::header::CONTENT_TYPE)) {
      BodyKind::Json => {
        decoder.decoded_json = serde_json::from_slice::<serde_json::Value>(&plain)
          .and_then(|value| serde_json::to_string_pretty(&value))
          .unwrap_or_else(|_| decode_text(headers, &plain));
      }
      BodyKind::Html => decoder.decoded_html = decode_text(headers, &plain),
      BodyKind::JavaScript => decoder.decoded_js = decode_text(headers, &plain),
      BodyKind::Text => decoder.decoded_text = decode_text(headers, &plain),
      BodyKind::Binary => {}
    }
  }
  let rendering = [
    &decoder.decoded_text,
    &decoder.decoded_json,
    &decoder.decoded_html,
    &decoder.decoded_js,
  ]
  .into_iter()
  .find(|s| !s.is_empty())
  .cloned()
  .unwrap_or_default();
  decoder.http_dump = format!("{}\n{}", head, rendering);
}

/// Serialise a start line and header block the way it goes on the wire
pub fn head_text(start_line: &str, headers: &HeaderMap) -> String {
  let mut head = String::from(start_line);
  head.push_str("\r\n");
  for (name, value) in headers {
    head.push_str(name.as_str());
    head.push_str(": ");
    head.push_str(&String::from_utf8_lossy(value.as_bytes()));
    head.push_str("\r\n");
  }
  head.push_str("\r\n");
  head
}

/// A `curl` invocation replaying a request through the proxy at `proxy`
pub fn curl_command(
  method: &http::Method,
  uri: &http::Uri,
  headers: &HeaderMap,
  body: &[u8],
  proxy: &str,
) -> String {
  let https = uri.scheme() == Some(&http::uri::Scheme::HTTPS);
  let mut curl_cmd = vec!["curl", "-x"];
  let proxy_url = format!("http://{}", proxy);
  curl_cmd.push(&proxy_url);
  curl_cmd.push("-X");
  curl_cmd.push(method.as_str());
  if https {
    curl_cmd.push("-k");
  }
  curl_cmd.push("--compressed");
  let mut command = curl_cmd.join(" ");
  command.push_str(" \\\n");
  for (k, v) in headers {
    let header = format!("{}: {}", k.as_str(), String::from_utf8_lossy(v.as_bytes()));
    command.push_str("  -H ");
    command.push_str(&bash_escape(&header));
    command.push_str(" \\\n");
  }
  if !body.is_empty() {
    command.push_str("  --data-binary ");
    command.push_str(&format!("$'{}'", body.escape_ascii()));
    command.push_str(" \\\n");
  }
  command.push_str("  ");
  command.push_str(&bash_escape(&uri.to_string()));
  command
}

fn bash_escape(s: &str) -> String {
  format!("'{}'", s.replace('\'', "'\\''"))
}
