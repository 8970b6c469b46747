//! End-to-end tests through a live listener

use futures_util::{SinkExt, StreamExt};
use mitmproxy::{
  CertServer, EventSink, Proxy, ProxyConfig, SchemeType, Session, StreamDirection,
  WebsocketMessageType,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::tungstenite::Message;

/// What a test needs from one emitted session
#[derive(Debug, Clone)]
struct Record {
  scheme: SchemeType,
  direction: StreamDirection,
  method: String,
  host: String,
  status: String,
  note: String,
  payload: Vec<u8>,
  message_type: Option<WebsocketMessageType>,
}

#[derive(Default)]
struct Recorder {
  records: Mutex<Vec<Record>>,
}

impl Recorder {
  fn records(&self) -> Vec<Record> {
    self.records.lock().unwrap().clone()
  }

  /// Wait until `ready` holds for the recorded events
  async fn wait_for(&self, ready: impl Fn(&[Record]) -> bool) -> Vec<Record> {
    for _ in 0..100 {
      let records = self.records();
      if ready(&records) {
        return records;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    self.records()
  }
}

impl EventSink for Recorder {
  fn on_event(&self, session: &Session) {
    let packet = &session.packet;
    self.records.lock().unwrap().push(Record {
      scheme: packet.edit.scheme,
      direction: packet.direction,
      method: packet.edit.method.clone(),
      host: packet.edit.host.clone(),
      status: packet.edit.status.clone(),
      note: packet.edit.note.clone(),
      payload: session.current_decoder().payload.clone(),
      message_type: packet.websocket_message_type,
    });
  }
}

fn scratch_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("mitmproxy-it-{}-{}", name, std::process::id()));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

fn test_config(name: &str) -> ProxyConfig {
  ProxyConfig {
    port: "0".to_string(),
    ca_dir: scratch_dir(name),
    dial_timeout: Duration::from_secs(5),
    handshake_timeout: Duration::from_secs(5),
    verify_upstream: false,
    tunnel_ip_hosts: false,
    ..Default::default()
  }
}

/// Start a proxy on an ephemeral port
async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Arc<Proxy>, Arc<Recorder>) {
  let recorder = Arc::new(Recorder::default());
  let sink: Arc<dyn EventSink> = recorder.clone();
  let proxy = Arc::new(Proxy::new(config, Some(sink)).await.unwrap());
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let server = proxy.clone();
  tokio::spawn(async move { server.serve(listener).await });
  (addr, proxy, recorder)
}

/// Origin echoing every byte back until the client hangs up
async fn echo_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let (mut stream, _) = listener.accept().await.unwrap();
      tokio::spawn(async move {
        let (mut reader, mut writer) = stream.split();
        tokio::io::copy(&mut reader, &mut writer).await.ok();
      });
    }
  });
  addr
}

/// Read up to and including the blank line ending a response head
async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> String {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    reader.read_exact(&mut byte).await.unwrap();
    head.push(byte[0]);
  }
  String::from_utf8(head).unwrap()
}

async fn cleanup(proxy: &Proxy) {
  if let Some(dir) = proxy.context().config.ca_cert_path().parent() {
    std::fs::remove_dir_all(dir).ok();
  }
}

#[tokio::test]
async fn test_http_exchange_emits_one_pair() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    read_head(&mut stream).await;
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello")
      .await
      .unwrap();
  });
  let (addr, proxy, recorder) = start_proxy(test_config("http")).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  let request = format!(
    "GET http://{0}/greeting HTTP/1.1\r\nHost: {0}\r\nConnection: close\r\n\r\n",
    origin_addr
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let mut response = String::new();
  client.read_to_string(&mut response).await.unwrap();
  assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
  assert!(response.ends_with("hello"));

  let records = recorder.wait_for(|r| r.len() >= 2).await;
  assert_eq!(records.len(), 2, "{:?}", records);
  assert_eq!(records[0].direction, StreamDirection::Inbound);
  assert_eq!(records[0].method, "GET");
  assert_eq!(records[0].host, "127.0.0.1");
  assert_eq!(records[0].scheme, SchemeType::Http);
  assert_eq!(records[1].direction, StreamDirection::Outbound);
  assert_eq!(records[1].status, "200 OK");
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_origin_failure_yields_bad_gateway() {
  let closed = {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let (addr, proxy, recorder) = start_proxy(test_config("bad-gateway")).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  let request = format!("GET http://{0}/ HTTP/1.1\r\nHost: {0}\r\n\r\n", closed);
  client.write_all(request.as_bytes()).await.unwrap();
  let mut response = String::new();
  client.read_to_string(&mut response).await.unwrap();
  assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"), "{}", response);
  assert!(response.contains("warning: 199"));

  let records = recorder.wait_for(|r| r.len() >= 2).await;
  assert_eq!(records.len(), 2, "{:?}", records);
  assert_eq!(records[0].direction, StreamDirection::Inbound);
  assert_eq!(records[1].direction, StreamDirection::Outbound);
  assert_eq!(records[1].status, "502 Bad Gateway");
  assert!(!records[1].note.is_empty());
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_head_response_keeps_origin_length() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HEAD "), "{}", head);
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/zip\r\nContent-Length: 4096\r\n\r\n")
      .await
      .unwrap();
  });
  let (addr, proxy, _recorder) = start_proxy(test_config("head")).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  let request = format!(
    "HEAD http://{0}/archive.zip HTTP/1.1\r\nHost: {0}\r\nConnection: close\r\n\r\n",
    origin_addr
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let mut response = String::new();
  client.read_to_string(&mut response).await.unwrap();
  assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
  assert!(response.contains("content-length: 4096\r\n"), "{}", response);
  assert!(response.ends_with("\r\n\r\n"));
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_oversized_chunk_is_contained() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    read_head(&mut stream).await;
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\n")
      .await
      .unwrap();
    let (mut stream, _) = origin.accept().await.unwrap();
    read_head(&mut stream).await;
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
      .await
      .unwrap();
  });
  let (addr, proxy, _recorder) = start_proxy(test_config("chunk-limit")).await;

  for expected in ["HTTP/1.1 502 Bad Gateway", "HTTP/1.1 200 OK"] {
    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
      "GET http://{0}/ HTTP/1.1\r\nHost: {0}\r\nConnection: close\r\n\r\n",
      origin_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with(expected), "{}", response);
  }
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_tls_interception_issues_sni_certificate() {
  let (addr, proxy, recorder) = start_proxy(test_config("tls")).await;

  // TLS origin presenting a leaf from the proxy's own cache
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  let origin_config = mitmproxy::tls::server_config(&proxy.context().certs, "127.0.0.1")
    .await
    .unwrap();
  tokio::spawn(async move {
    let (stream, _) = origin.accept().await.unwrap();
    let mut tls = TlsAcceptor::from(origin_config).accept(stream).await.unwrap();
    read_head(&mut tls).await;
    tls
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecure")
      .await
      .unwrap();
    tls.shutdown().await.ok();
  });

  let mut client = TcpStream::connect(addr).await.unwrap();
  let connect = format!(
    "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n",
    origin_addr
  );
  client.write_all(connect.as_bytes()).await.unwrap();
  let head = read_head(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 200 Connection Established"), "{}", head);

  let roots = proxy.authority().root_store().unwrap();
  let config = ClientConfig::builder_with_provider(Arc::new(
    rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .unwrap()
  .with_root_certificates(roots)
  .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  let name = ServerName::try_from("example.org").unwrap();
  let mut tls = connector.connect(name, client).await.unwrap();

  let leaf = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
  let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).unwrap();
  let common_name = cert
    .subject()
    .iter_common_name()
    .next()
    .and_then(|cn| cn.as_str().ok())
    .unwrap();
  assert_eq!(common_name, "example.org");
  assert!(cert.validity().is_valid());

  let request = format!(
    "GET /secret HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    origin_addr
  );
  tls.write_all(request.as_bytes()).await.unwrap();
  let mut response = Vec::new();
  let mut buf = [0u8; 1024];
  while !response.ends_with(b"secure") {
    let n = tls.read(&mut buf).await.unwrap();
    assert!(n > 0, "connection closed early");
    response.extend_from_slice(&buf[..n]);
  }
  assert!(response.starts_with(b"HTTP/1.1 200 OK"));

  let records = recorder.wait_for(|r| r.len() >= 2).await;
  assert_eq!(records.len(), 2, "{:?}", records);
  assert_eq!(records[0].scheme, SchemeType::Https);
  assert_eq!(records[0].direction, StreamDirection::Inbound);
  assert_eq!(records[0].method, "GET");
  assert_eq!(records[0].host, "127.0.0.1");
  assert_eq!(records[1].status, "200 OK");
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_nested_connect_is_refused() {
  let (addr, proxy, _recorder) = start_proxy(test_config("nested")).await;
  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"CONNECT 127.0.0.1:9 HTTP/1.1\r\nHost: 127.0.0.1:9\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
  client
    .write_all(b"CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 405"), "{}", head);
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_ip_host_connect_is_tunnelled_with_batching() {
  let origin = echo_origin().await;
  let config = ProxyConfig {
    tunnel_ip_hosts: true,
    ..test_config("tunnel")
  };
  let (addr, proxy, recorder) = start_proxy(config).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  let connect = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", origin);
  client.write_all(connect.as_bytes()).await.unwrap();
  let head = read_head(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 200 Connection Established"), "{}", head);

  let mut echoed = [0u8; 12];
  client.write_all(b"first chunk!").await.unwrap();
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"first chunk!");
  client.write_all(b"second chunk").await.unwrap();
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"second chunk");
  client.shutdown().await.unwrap();
  let mut rest = Vec::new();
  client.read_to_end(&mut rest).await.unwrap();
  assert!(rest.is_empty());

  let records = recorder
    .wait_for(|r| r.iter().any(|r| r.direction == StreamDirection::Inbound))
    .await;
  let inbound: Vec<_> = records
    .iter()
    .filter(|r| r.direction == StreamDirection::Inbound)
    .collect();
  assert_eq!(inbound.len(), 1, "{:?}", records);
  assert_eq!(inbound[0].scheme, SchemeType::Tcp);
  assert_eq!(inbound[0].payload, b"first chunk!second chunk".to_vec());
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_socks5_connect_relays_bytes() {
  let origin = echo_origin().await;
  let (addr, proxy, recorder) = start_proxy(test_config("socks5")).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  assert_eq!(method, [0x05, 0x00]);

  let SocketAddr::V4(origin_v4) = origin else {
    panic!("origin is IPv4");
  };
  let mut request = vec![0x05, 0x01, 0x00, 0x01];
  request.extend_from_slice(&origin_v4.ip().octets());
  request.extend_from_slice(&origin_v4.port().to_be_bytes());
  client.write_all(&request).await.unwrap();
  let mut reply = [0u8; 10];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

  client.write_all(b"hello through socks").await.unwrap();
  let mut echoed = [0u8; 19];
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"hello through socks");
  drop(client);

  let records = recorder.wait_for(|r| !r.is_empty()).await;
  assert!(records.iter().all(|r| r.scheme == SchemeType::Socks5));
  assert!(records.iter().all(|r| r.method == "CONNECT"));
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_socks5_username_password() {
  let origin = echo_origin().await;
  let config = ProxyConfig {
    socks_credentials: Some(("alice".to_string(), "secret".to_string())),
    ..test_config("socks5-auth")
  };
  let (addr, proxy, _recorder) = start_proxy(config).await;

  async fn login(addr: SocketAddr, password: &str) -> (TcpStream, u8) {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x02]);
    let mut auth = vec![0x01, 5];
    auth.extend_from_slice(b"alice");
    auth.push(password.len() as u8);
    auth.extend_from_slice(password.as_bytes());
    client.write_all(&auth).await.unwrap();
    let mut status = [0u8; 2];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status[0], 0x01);
    (client, status[1])
  }

  let (_, status) = login(addr, "wrong").await;
  assert_ne!(status, 0x00);

  let (mut client, status) = login(addr, "secret").await;
  assert_eq!(status, 0x00);
  let mut request = vec![0x05, 0x01, 0x00, 0x03, 9];
  request.extend_from_slice(b"localhost");
  request.extend_from_slice(&origin.port().to_be_bytes());
  client.write_all(&request).await.unwrap();
  let mut reply = [0u8; 4];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply[..2], &[0x05, 0x00]);
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_socks5_rejects_when_no_method_matches() {
  let config = ProxyConfig {
    socks_credentials: Some(("alice".to_string(), "secret".to_string())),
    ..test_config("socks5-none")
  };
  let (addr, proxy, _recorder) = start_proxy(config).await;
  let mut client = TcpStream::connect(addr).await.unwrap();
  client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  assert_eq!(method, [0x05, 0xff]);
  cleanup(&proxy).await;
}

/// Offer "no authentication" and expect it to be selected
async fn socks5_greet(client: &mut TcpStream) {
  client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  assert_eq!(method, [0x05, 0x00]);
}

fn reply_addr(reply: &[u8; 10]) -> SocketAddr {
  let ip = std::net::Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
  SocketAddr::from((ip, u16::from_be_bytes([reply[8], reply[9]])))
}

#[tokio::test]
async fn test_socks5_bind_sends_two_replies_then_relays() {
  let (addr, proxy, recorder) = start_proxy(test_config("socks5-bind")).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  socks5_greet(&mut client).await;
  client
    .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
    .await
    .unwrap();
  let mut first = [0u8; 10];
  client.read_exact(&mut first).await.unwrap();
  assert_eq!(&first[..4], &[0x05, 0x00, 0x00, 0x01]);
  let bound = reply_addr(&first);
  assert_ne!(bound.port(), 0);

  let mut peer = TcpStream::connect(bound).await.unwrap();
  let mut second = [0u8; 10];
  client.read_exact(&mut second).await.unwrap();
  assert_eq!(&second[..4], &[0x05, 0x00, 0x00, 0x01]);
  assert_eq!(reply_addr(&second), peer.local_addr().unwrap());

  peer.write_all(b"from peer").await.unwrap();
  let mut got = [0u8; 9];
  client.read_exact(&mut got).await.unwrap();
  assert_eq!(&got, b"from peer");
  client.write_all(b"from client").await.unwrap();
  let mut got = [0u8; 11];
  peer.read_exact(&mut got).await.unwrap();
  assert_eq!(&got, b"from client");
  drop(client);
  drop(peer);

  let records = recorder.wait_for(|r| !r.is_empty()).await;
  assert!(records.iter().all(|r| r.method == "BIND"), "{:?}", records);
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_socks5_associate_held_until_client_closes() {
  let (addr, proxy, _recorder) = start_proxy(test_config("socks5-udp")).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  socks5_greet(&mut client).await;
  client
    .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
    .await
    .unwrap();
  let mut reply = [0u8; 10];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
  let relay = reply_addr(&reply);
  assert_eq!(relay.ip(), addr.ip());
  assert_ne!(relay.port(), 0);

  client.shutdown().await.unwrap();
  let mut rest = Vec::new();
  let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(n, 0);
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_socks4_unsupported_command_rejected() {
  use mitmproxy::conn::ClientConn;
  use mitmproxy::socks::Socks4Handler;
  use mitmproxy::Handler;

  let (_addr, proxy, _recorder) = start_proxy(test_config("socks4-reject")).await;
  let ctx = proxy.context().clone();
  let (mut client, server) = tokio::io::duplex(1024);
  let conn = ClientConn::new(
    server,
    "127.0.0.1:40000".parse().unwrap(),
    "127.0.0.1:1080".parse().unwrap(),
  );
  let session = ctx.session(&conn, SchemeType::Socks4);
  let handler = tokio::spawn(async move { Socks4Handler::new(ctx, session).serve(conn).await });

  client
    .write_all(&[0x04, 0x03, 0x00, 0x50, 127, 0, 0, 1, 0x00])
    .await
    .unwrap();
  let mut reply = [0u8; 8];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply[0], 0x00);
  assert_eq!(reply[1], 0x5b);
  assert!(handler.await.unwrap().is_err());
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_socks4a_connect() {
  let origin = echo_origin().await;
  let (addr, proxy, recorder) = start_proxy(test_config("socks4a")).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  let mut request = vec![0x04, 0x01];
  request.extend_from_slice(&origin.port().to_be_bytes());
  request.extend_from_slice(&[0, 0, 0, 1]);
  request.extend_from_slice(b"ident\0localhost\0");
  client.write_all(&request).await.unwrap();
  let mut reply = [0u8; 8];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply[..2], &[0x00, 0x5a]);

  client.write_all(b"ping over socks4a").await.unwrap();
  let mut echoed = [0u8; 17];
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"ping over socks4a");
  drop(client);

  let records = recorder.wait_for(|r| !r.is_empty()).await;
  assert!(records.iter().all(|r| r.scheme == SchemeType::Socks4));
  assert!(records
    .iter()
    .all(|r| r.host == format!("localhost:{}", origin.port())));
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_websocket_echo_through_proxy() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (stream, _) = origin.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    while let Some(Ok(message)) = ws.next().await {
      if message.is_text() || message.is_binary() {
        ws.send(message).await.unwrap();
      } else if message.is_close() {
        break;
      }
    }
  });
  let (addr, proxy, recorder) = start_proxy(test_config("websocket")).await;

  let stream = TcpStream::connect(addr).await.unwrap();
  let url = format!("ws://{}/chat", origin_addr);
  let (mut ws, response) = tokio_tungstenite::client_async(url, stream).await.unwrap();
  assert_eq!(response.status(), http::StatusCode::SWITCHING_PROTOCOLS);

  ws.send(Message::Text("hello socket".into())).await.unwrap();
  let echoed = ws.next().await.unwrap().unwrap();
  assert_eq!(echoed, Message::Text("hello socket".into()));
  ws.close(None).await.ok();

  let records = recorder.wait_for(|r| r.len() >= 2).await;
  let texts: Vec<_> = records
    .iter()
    .filter(|r| r.message_type == Some(WebsocketMessageType::Text))
    .collect();
  assert_eq!(texts.len(), 2, "{:?}", records);
  assert_eq!(texts[0].direction, StreamDirection::Inbound);
  assert_eq!(texts[1].direction, StreamDirection::Outbound);
  assert!(texts.iter().all(|r| r.scheme == SchemeType::WebSocket));
  assert!(texts.iter().all(|r| r.payload == b"hello socket".to_vec()));
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_cert_endpoint_serves_root() {
  let config = test_config("cert-endpoint");
  let recorder: Arc<dyn EventSink> = Arc::new(Recorder::default());
  let proxy = Proxy::new(config, Some(recorder)).await.unwrap();
  let server = CertServer::new(proxy.authority(), "127.0.0.1", 0);
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move { server.serve(listener).await });

  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
    .await
    .unwrap();
  let mut response = String::new();
  client.read_to_string(&mut response).await.unwrap();
  assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
  assert!(response.contains("content-type: application/x-x509-ca-cert"));
  assert!(response.ends_with(proxy.authority().cert_pem()));

  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"GET /other HTTP/1.1\r\nHost: localhost\r\n\r\n")
    .await
    .unwrap();
  let mut response = String::new();
  client.read_to_string(&mut response).await.unwrap();
  assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
  cleanup(&proxy).await;
}

#[tokio::test]
async fn test_restart_reuses_root() {
  let config = test_config("reload");
  let first = Proxy::new(config.clone(), None).await.unwrap();
  let second = Proxy::new(config, None).await.unwrap();
  assert_eq!(first.authority().cert_pem(), second.authority().cert_pem());
  cleanup(&second).await;
}
