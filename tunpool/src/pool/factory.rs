// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{io, sync::Arc, time::Duration};

use futures::future::{BoxFuture, FutureExt};
use tracing_futures::Instrument;

use crate::{
  common::protocol::{compress::CompStream, BoxedSession, MuxConnector, MuxError, Transport},
  util::tunnel_stream::boxed,
};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Failed to dial transport")]
  Dial(#[source] io::Error),
  #[error("Failed to negotiate mux session")]
  Negotiate(#[source] MuxError),
  #[error("Session creation timed out after {0:?}")]
  TimedOut(Duration),
}

/// Produces fresh mux sessions for the pool
pub trait SessionSource: Send + Sync {
  fn create(&self) -> BoxFuture<'static, Result<BoxedSession, SessionError>>;
}

/// Builds a session bottom-up: transport, optional compression, mux negotiation
pub struct SessionFactory {
  transport: Arc<dyn Transport>,
  connector: Arc<dyn MuxConnector>,
  compression: bool,
  dial_timeout: Duration,
}

impl std::fmt::Debug for SessionFactory {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionFactory")
      .field("compression", &self.compression)
      .field("dial_timeout", &self.dial_timeout)
      .finish_non_exhaustive()
  }
}

impl SessionFactory {
  pub fn new(transport: Arc<dyn Transport>, connector: Arc<dyn MuxConnector>) -> Self {
    Self {
      transport,
      connector,
      compression: true,
      dial_timeout: DEFAULT_DIAL_TIMEOUT,
    }
  }

  pub fn with_compression(mut self, compression: bool) -> Self {
    self.compression = compression;
    self
  }

  /// Bounds dialing and negotiation together
  pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
    self.dial_timeout = dial_timeout;
    self
  }

  pub fn create_session(&self) -> BoxFuture<'static, Result<BoxedSession, SessionError>> {
    let transport = Arc::clone(&self.transport);
    let connector = Arc::clone(&self.connector);
    let compression = self.compression;
    let dial_timeout = self.dial_timeout;
    async move {
      let establish = async move {
        let conn = transport.dial().await.map_err(SessionError::Dial)?;
        let conn = if compression {
          boxed(CompStream::new(conn))
        } else {
          conn
        };
        connector
          .client(conn)
          .await
          .map_err(SessionError::Negotiate)
      };
      let session = tokio::time::timeout(dial_timeout, establish)
        .await
        .map_err(|_| SessionError::TimedOut(dial_timeout))??;
      tracing::debug!("Session established");
      Ok(session)
    }
    .instrument(tracing::debug_span!("create_session", compression))
    .boxed()
  }
}

impl SessionSource for SessionFactory {
  fn create(&self) -> BoxFuture<'static, Result<BoxedSession, SessionError>> {
    self.create_session()
  }
}

#[cfg(test)]
mod tests {
  use futures::StreamExt;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio_yamux::{Config, Session};

  use super::*;
  use crate::common::protocol::{mux::YamuxConnector, transport::MockTransport};

  fn transport_returning(conn: tokio::io::DuplexStream) -> MockTransport {
    let mut conn = Some(conn);
    let mut transport = MockTransport::new();
    transport.expect_dial().times(1).returning(move || {
      let conn = conn.take().expect("dialed more than once");
      futures::future::ready(Ok(boxed(conn))).boxed()
    });
    transport
  }

  #[tokio::test]
  async fn dial_failures_are_reported_as_such() {
    let mut transport = MockTransport::new();
    transport.expect_dial().times(1).returning(|| {
      futures::future::ready(Err(io::ErrorKind::ConnectionRefused.into())).boxed()
    });
    let factory = SessionFactory::new(Arc::new(transport), Arc::new(YamuxConnector::default()));
    match factory.create_session().await {
      Err(SessionError::Dial(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
      other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn hung_dials_time_out() {
    let mut transport = MockTransport::new();
    transport
      .expect_dial()
      .times(1)
      .returning(|| futures::future::pending().boxed());
    let factory = SessionFactory::new(Arc::new(transport), Arc::new(YamuxConnector::default()))
      .with_dial_timeout(Duration::from_secs(3));
    match factory.create_session().await {
      Err(SessionError::TimedOut(after)) => assert_eq!(after, Duration::from_secs(3)),
      other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
  }

  #[tokio::test]
  async fn compressed_sessions_reach_a_compressed_peer() {
    let (near, far) = tokio::io::duplex(256 * 1024);
    tokio::spawn(async move {
      let mut server = Session::new_server(CompStream::new(far), Config::default());
      while let Some(Ok(stream)) = server.next().await {
        tokio::spawn(async move {
          let (mut r, mut w) = tokio::io::split(stream);
          let _ = tokio::io::copy(&mut r, &mut w).await;
        });
      }
    });

    let factory = SessionFactory::new(
      Arc::new(transport_returning(near)),
      Arc::new(YamuxConnector::default()),
    );
    let mut session = factory.create().await.unwrap();
    let mut stream = session.open().await.unwrap();
    let payload = b"compressible ".repeat(512);
    stream.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
      .await
      .expect("echo timed out")
      .unwrap();
    assert_eq!(echoed, payload);
    session.close();
  }
}
