// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Yamux client sessions over [`tokio_yamux`]
use std::{
  io,
  pin::Pin,
  task::{Context, Poll},
  time::Duration,
};

use futures::{
  future::{BoxFuture, FutureExt},
  StreamExt,
};
use tokio::{
  io::{AsyncRead, AsyncWrite, ReadBuf},
  sync::mpsc,
  task::JoinHandle,
};
use tokio_yamux::{Config, Control, Session, StreamHandle};
use tracing_futures::Instrument;

use super::{BoxedSession, MuxConnector, MuxError, MuxSession};
use crate::util::tunnel_stream::BoxedStream;

/// Smallest stream window the yamux protocol allows
pub const MIN_STREAM_WINDOW: u32 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YamuxSettings {
  pub accept_backlog: usize,
  pub keepalive_interval: Duration,
  pub write_timeout: Duration,
  pub max_stream_window: u32,
}

impl YamuxSettings {
  /// Stream windows follow the socket buffer size, never dropping below [`MIN_STREAM_WINDOW`]
  pub fn new(sockbuf: usize, keepalive_interval: Duration) -> Self {
    let window = u32::try_from(sockbuf).unwrap_or(u32::MAX);
    Self {
      accept_backlog: 256,
      keepalive_interval,
      write_timeout: Duration::from_secs(10),
      max_stream_window: window.max(MIN_STREAM_WINDOW),
    }
  }

  fn to_config(self) -> Config {
    let mut config = Config::default();
    config.accept_backlog = self.accept_backlog;
    // A zero interval disables keepalive
    config.enable_keepalive = !self.keepalive_interval.is_zero();
    config.keepalive_interval = self.keepalive_interval;
    config.connection_write_timeout = self.write_timeout;
    config.max_stream_window_size = self.max_stream_window;
    config
  }
}

impl Default for YamuxSettings {
  fn default() -> Self {
    Self::new(4 * 1024 * 1024, Duration::from_secs(30))
  }
}

#[derive(Debug, Default, Clone)]
pub struct YamuxConnector {
  settings: YamuxSettings,
}

impl YamuxConnector {
  pub fn new(settings: YamuxSettings) -> Self {
    Self { settings }
  }
}

impl MuxConnector for YamuxConnector {
  fn client(&self, conn: BoxedStream) -> BoxFuture<'static, Result<BoxedSession, MuxError>> {
    let config = self.settings.to_config();
    async move {
      let mut session = Session::new_client(conn, config);
      let control = session.control();
      let driver = tokio::spawn(
        async move {
          while let Some(incoming) = session.next().await {
            match incoming {
              Ok(stream) => {
                tracing::debug!("Dropping unsolicited inbound stream");
                drop(stream);
              }
              Err(e) => {
                tracing::debug!(error = %e, "Mux session terminated");
                break;
              }
            }
          }
        }
        .instrument(tracing::debug_span!("yamux_session")),
      );
      let (outstanding, drained) = mpsc::channel(1);
      Ok(Box::new(YamuxSession {
        control,
        outstanding,
        drained,
        driver,
      }) as BoxedSession)
    }
    .boxed()
  }
}

/// Client session; every stream it hands out holds a clone of `outstanding`,
/// so `drained` yields `None` once the session and all its streams are gone.
struct YamuxSession {
  control: Control,
  outstanding: mpsc::Sender<()>,
  drained: mpsc::Receiver<()>,
  driver: JoinHandle<()>,
}

impl MuxSession for YamuxSession {
  fn open(&mut self) -> BoxFuture<'_, Result<BoxedStream, MuxError>> {
    async move {
      if self.driver.is_finished() {
        return Err(MuxError::Closed);
      }
      let stream = self
        .control
        .open_stream()
        .await
        .map_err(|e| MuxError::Protocol(format!("{:?}", e)))?;
      Ok(Box::new(YamuxStream {
        inner: stream,
        _session: self.outstanding.clone(),
      }) as BoxedStream)
    }
    .boxed()
  }

  fn close(self: Box<Self>) {
    let YamuxSession {
      mut control,
      outstanding,
      mut drained,
      driver,
    } = *self;
    drop(outstanding);
    if driver.is_finished() {
      return;
    }
    tokio::spawn(
      async move {
        // Streams already relaying keep the session up until they finish
        let _ = drained.recv().await;
        let _ = control.close().await;
        tracing::debug!("Retired mux session shut down");
      }
      .instrument(tracing::debug_span!("yamux_retire")),
    );
  }
}

struct YamuxStream {
  inner: StreamHandle,
  _session: mpsc::Sender<()>,
}

impl AsyncRead for YamuxStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    AsyncRead::poll_read(Pin::new(&mut self.get_mut().inner), cx, buf)
  }
}

impl AsyncWrite for YamuxStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    AsyncWrite::poll_write(Pin::new(&mut self.get_mut().inner), cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().inner), cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().inner), cx)
  }
}
