//! Full-duplex byte relay with per-read session events
//!
//! Both directions copy in [`CHUNK_SIZE`] reads and write every byte
//! through unchanged. What gets reported differs only at the start of a
//! direction: reads are held back until two of them exceed
//! [`MIN_MESSAGE_SIZE`], then reported as one event, so a handshake split
//! over several segments shows up as a single record.

use crate::conn::{ClientConn, Rewind};
use crate::error::{Error, Result};
use crate::handler::{Handler, ProxyContext};
use crate::session::{SchemeType, Session, StreamDirection};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Read size for each relay direction
pub const CHUNK_SIZE: usize = 32 * 1024;
/// Reads of this size or smaller do not count towards the opening batch
pub const MIN_MESSAGE_SIZE: usize = 8;
const BATCH_MESSAGES: usize = 2;

/// Bytes captured from one read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelMessage {
  pub direction: StreamDirection,
  pub payload: Bytes,
}

/// Decides which reads of one direction become events
#[derive(Debug)]
pub struct Batcher {
  direction: StreamDirection,
  pending: Vec<TunnelMessage>,
  counted: usize,
  done: bool,
}

impl Batcher {
  pub fn new(direction: StreamDirection) -> Self {
    Self {
      direction,
      pending: Vec::new(),
      counted: 0,
      done: false,
    }
  }

  /// Feed one read; returns the payload to report, if any
  pub fn push(&mut self, data: &[u8]) -> Option<Bytes> {
    if self.done {
      return Some(Bytes::copy_from_slice(data));
    }
    self.pending.push(TunnelMessage {
      direction: self.direction,
      payload: Bytes::copy_from_slice(data),
    });
    if data.len() > MIN_MESSAGE_SIZE {
      self.counted += 1;
    }
    if self.counted < BATCH_MESSAGES {
      return None;
    }
    self.done = true;
    self.take_pending()
  }

  /// Whatever is still held back when the direction ends
  pub fn flush(&mut self) -> Option<Bytes> {
    self.done = true;
    self.take_pending()
  }

  fn take_pending(&mut self) -> Option<Bytes> {
    if self.pending.is_empty() {
      return None;
    }
    let joined: Vec<u8> = self
      .pending
      .drain(..)
      .flat_map(|m| m.payload.to_vec())
      .collect();
    Some(joined.into())
  }
}

fn report(session: &Mutex<&mut Session>, direction: StreamDirection, payload: &[u8]) {
  let Ok(mut session) = session.lock() else {
    return;
  };
  session.set_direction(direction);
  session.packet.edit.content_length = payload.len();
  if direction == StreamDirection::Outbound {
    session.packet.edit.elapsed = session.elapsed();
  }
  session.decoder_mut(direction).set_payload(payload);
  session.emit();
}

async fn pump<R, W>(
  session: &Mutex<&mut Session>,
  direction: StreamDirection,
  mut src: R,
  mut dst: W,
  done: &watch::Sender<bool>,
  mut stop: watch::Receiver<bool>,
) -> io::Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; CHUNK_SIZE];
  let mut batcher = Batcher::new(direction);
  let mut total = 0u64;
  let result = loop {
    let n = tokio::select! {
      read = src.read(&mut buf) => match read {
        Ok(0) => break Ok(total),
        Ok(n) => n,
        Err(e) => break Err(e),
      },
      _ = stop.changed() => break Ok(total),
    };
    if let Some(payload) = batcher.push(&buf[..n]) {
      report(session, direction, &payload);
    }
    if let Err(e) = dst.write_all(&buf[..n]).await {
      break Err(e);
    }
    total += n as u64;
  };
  if let Some(payload) = batcher.flush() {
    report(session, direction, &payload);
  }
  let _ = dst.shutdown().await;
  let _ = done.send(true);
  result
}

/// Relay between `client` and `origin` until either side stops.
///
/// Client reads are reported as Inbound, origin reads as Outbound. When one
/// direction ends the other is stopped and both write halves are shut down.
pub async fn relay<C, O>(session: &mut Session, client: C, origin: O) -> Result<()>
where
  C: AsyncRead + AsyncWrite + Unpin,
  O: AsyncRead + AsyncWrite + Unpin,
{
  let (client_read, client_write) = tokio::io::split(client);
  let (origin_read, origin_write) = tokio::io::split(origin);
  let (done, stop) = watch::channel(false);
  let shared = Mutex::new(session);
  let (inbound, outbound) = tokio::join!(
    pump(
      &shared,
      StreamDirection::Inbound,
      client_read,
      origin_write,
      &done,
      stop.clone()
    ),
    pump(
      &shared,
      StreamDirection::Outbound,
      origin_read,
      client_write,
      &done,
      stop
    ),
  );
  tracing::debug!(
    "Tunnel closed, {:?} bytes in, {:?} bytes out",
    inbound.as_ref().ok(),
    outbound.as_ref().ok()
  );
  inbound?;
  outbound?;
  Ok(())
}

/// Raw TCP passthrough to a fixed target
pub struct TcpHandler {
  ctx: Arc<ProxyContext>,
  session: Session,
  host: String,
  port: u16,
  preface: Bytes,
  established: bool,
}

impl TcpHandler {
  pub fn new(ctx: Arc<ProxyContext>, mut session: Session, host: &str, port: u16) -> Self {
    session.set_scheme(SchemeType::Tcp);
    session.packet.edit.host = target(host, port);
    Self {
      ctx,
      session,
      host: host.to_string(),
      port,
      preface: Bytes::new(),
      established: false,
    }
  }

  /// Bytes relayed to the target ahead of the client stream
  pub fn with_preface(mut self, preface: impl Into<Bytes>) -> Self {
    self.preface = preface.into();
    self
  }

  /// Answer `200 Connection Established` before relaying
  pub fn reply_established(mut self) -> Self {
    self.established = true;
    self
  }
}

fn target(host: &str, port: u16) -> String {
  if host.contains(':') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  }
}

#[async_trait]
impl Handler for TcpHandler {
  fn scheme(&self) -> SchemeType {
    SchemeType::Tcp
  }

  async fn serve(&mut self, mut conn: ClientConn) -> Result<()> {
    let origin = match self.ctx.connector.connect(&self.host, self.port).await {
      Ok(origin) => origin,
      Err(e) => {
        if self.established {
          let response = crate::http::HttpResponse::bad_gateway(&e.to_string());
          conn.writer().write_all(&response.to_raw(true)).await?;
        }
        return Err(Error::connection_error(format!(
          "Failed to connect to {}: {}",
          target(&self.host, self.port),
          e
        )));
      }
    };
    if self.established {
      conn
        .writer()
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
      conn.writer().flush().await?;
    }
    self.session.reset_clock();
    let client = Rewind::new(std::mem::take(&mut self.preface), conn.into_io());
    relay(&mut self.session, client, origin).await
  }
}
