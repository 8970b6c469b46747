//! Plain HTTP endpoint handing out the root certificate
//!
//! `GET /` answers with the PEM root so clients can install it into their
//! trust stores. Everything else is `404`.

use crate::accept::{accept, Backoff};
use crate::ca::CertificateAuthority;
use crate::config::CA_CERT_FILE;
use crate::error::{Error, Result};
use crate::http::{HttpRequest, HttpResponse};
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, StatusCode};
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const CA_CERT_CONTENT_TYPE: &str = "application/x-x509-ca-cert";

/// Serves the root certificate over HTTP
#[derive(Clone)]
pub struct CertServer {
  addr: String,
  pem: Bytes,
}

impl CertServer {
  /// Endpoint for `ca` bound to `host:port`
  pub fn new(ca: &CertificateAuthority, host: &str, port: u16) -> Self {
    Self {
      addr: format!("{}:{}", host, port),
      pem: Bytes::copy_from_slice(ca.cert_pem().as_bytes()),
    }
  }

  /// Bind the configured address and serve until the listener fails
  pub async fn listen_and_serve(&self) -> Result<()> {
    let listener = TcpListener::bind(&self.addr).await.map_err(|e| {
      Error::proxy_error(format!(
        "Failed to bind certificate server to {}: {}",
        self.addr, e
      ))
    })?;
    tracing::info!(
      "Root certificate available at http://{}/",
      listener.local_addr()?
    );
    self.serve(listener).await
  }

  /// Serve requests from an already bound listener
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    let mut backoff = Backoff::default();
    loop {
      let (stream, peer_addr) = accept(&listener, &mut backoff).await?;
      let server = self.clone();
      tokio::spawn(async move {
        if let Err(e) = server.handle(stream, peer_addr).await {
          tracing::debug!("Certificate request from {} failed: {}", peer_addr, e);
        }
      });
    }
  }

  async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let Some(request) = HttpRequest::read(&mut reader).await? else {
      return Ok(());
    };
    let response = self.respond(&request);
    tracing::debug!(
      "{} {} {} -> {}",
      peer_addr,
      request.method,
      request.uri,
      response.status
    );
    let stream = reader.get_mut();
    stream.write_all(&response.to_raw(true)).await?;
    stream.shutdown().await?;
    Ok(())
  }

  fn respond(&self, request: &HttpRequest) -> HttpResponse {
    if request.uri.path() != "/" {
      return HttpResponse::simple(StatusCode::NOT_FOUND);
    }
    if request.method != Method::GET && request.method != Method::HEAD {
      return HttpResponse::simple(StatusCode::METHOD_NOT_ALLOWED);
    }
    let mut response = HttpResponse::simple(StatusCode::OK);
    response
      .headers
      .insert(CONTENT_TYPE, HeaderValue::from_static(CA_CERT_CONTENT_TYPE));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", CA_CERT_FILE)) {
      response.headers.insert(CONTENT_DISPOSITION, value);
    }
    if request.method == Method::GET {
      response.body = self.pem.clone();
    } else {
      response.head_only = true;
      response
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(self.pem.len()));
    }
    response
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(method: Method, path: &str) -> HttpRequest {
    HttpRequest {
      method,
      uri: path.parse().unwrap(),
      version: http::Version::HTTP_11,
      headers: Default::default(),
      body: Bytes::new(),
    }
  }

  fn server() -> CertServer {
    CertServer {
      addr: "127.0.0.1:0".to_string(),
      pem: Bytes::from_static(b"-----BEGIN CERTIFICATE-----\n"),
    }
  }

  #[test]
  fn test_root_path_serves_certificate() {
    let response = server().respond(&request(Method::GET, "/"));
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers[CONTENT_TYPE], CA_CERT_CONTENT_TYPE);
    assert!(response.body.starts_with(b"-----BEGIN CERTIFICATE"));
  }

  #[test]
  fn test_head_reports_certificate_length() {
    let server = server();
    let response = server.respond(&request(Method::HEAD, "/"));
    assert!(response.body.is_empty());
    let raw = String::from_utf8(response.to_raw(true)).unwrap();
    assert!(raw.contains(&format!("content-length: {}\r\n", server.pem.len())));
  }

  #[test]
  fn test_other_paths_not_found() {
    let response = server().respond(&request(Method::GET, "/favicon.ico"));
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(response.body.is_empty());
  }
}
