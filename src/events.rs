//! Event sinks receiving session snapshots

use crate::session::{SchemeType, Session, StreamDirection};
use std::sync::Arc;

/// Observer of every emitted session.
///
/// Called inline on the connection's task, so implementations should hand
/// heavy work off elsewhere.
pub trait EventSink: Send + Sync {
  fn on_event(&self, session: &Session);
}

impl<F> EventSink for F
where
  F: Fn(&Session) + Send + Sync,
{
  fn on_event(&self, session: &Session) {
    self(session)
  }
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
  fn on_event(&self, _session: &Session) {}
}

/// Sink printing each event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl LogSink {
  /// Use `sink` when given, else a [`LogSink`]
  pub fn or_default(sink: Option<Arc<dyn EventSink>>) -> Arc<dyn EventSink> {
    match sink {
      Some(sink) => sink,
      None => {
        tracing::warn!("No session event callback installed, printing events to the log");
        Arc::new(LogSink)
      }
    }
  }
}

impl EventSink for LogSink {
  fn on_event(&self, session: &Session) {
    let packet = &session.packet;
    let edit = &packet.edit;
    let decoder = session.current_decoder();
    match edit.scheme {
      SchemeType::Http | SchemeType::Https => match packet.direction {
        StreamDirection::Inbound => tracing::info!(
          "[{}] {} {} {}://{}{}",
          session.id,
          packet.direction,
          edit.method,
          edit.scheme,
          edit.host,
          edit.path
        ),
        StreamDirection::Outbound => tracing::info!(
          "[{}] {} {} {}{} {} {:?}",
          session.id,
          packet.direction,
          edit.status,
          edit.host,
          edit.path,
          edit.content_type,
          edit.elapsed
        ),
      },
      SchemeType::WebSocket | SchemeType::WebSocketTls => {
        let kind = packet
          .websocket_message_type
          .map(|t| t.to_string())
          .unwrap_or_default();
        let rendering = if decoder.decoded_text.is_empty() {
          &decoder.payload_hex_dump
        } else {
          &decoder.decoded_text
        };
        tracing::info!(
          "[{}] {} {} {}{} {}\n{}",
          session.id,
          packet.direction,
          kind,
          edit.host,
          edit.path,
          packet.websocket_status,
          rendering
        );
      }
      SchemeType::Socks4 | SchemeType::Socks5 | SchemeType::Tcp => tracing::info!(
        "[{}] {} {}://{} {} bytes\n{}",
        session.id,
        packet.direction,
        edit.scheme,
        edit.host,
        decoder.payload.len(),
        decoder.payload_hex_dump
      ),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::SocketAddr;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn test_closure_sink() {
    let count = Arc::new(AtomicUsize::new(0));
    let sink: Arc<dyn EventSink> = {
      let count = count.clone();
      Arc::new(move |_: &Session| {
        count.fetch_add(1, Ordering::SeqCst);
      })
    };
    let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let session = Session::new(addr, SchemeType::Http, sink);
    session.emit();
    session.emit();
    assert_eq!(count.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_log_sink_handles_every_scheme() {
    let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    for scheme in [
      SchemeType::Http,
      SchemeType::WebSocket,
      SchemeType::Socks5,
      SchemeType::Tcp,
    ] {
      let mut session = Session::new(addr, scheme, Arc::new(LogSink));
      session.set_direction(StreamDirection::Outbound);
      session.emit();
    }
  }
}
