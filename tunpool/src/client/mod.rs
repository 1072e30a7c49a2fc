// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Local TCP front end: accepts connections and relays each over a pooled session
use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{pool::SessionPool, util::relay};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Dispatcher {
  pool: Arc<SessionPool>,
  sockbuf: usize,
}

/// Buffer sizing is best-effort; failures are logged and the connection kept
fn apply_socket_buffers(stream: &TcpStream, sockbuf: usize) {
  let socket = SockRef::from(stream);
  if let Err(e) = socket.set_recv_buffer_size(sockbuf) {
    tracing::warn!(error = %e, size = sockbuf, "TCP SetReadBuffer failed");
  }
  if let Err(e) = socket.set_send_buffer_size(sockbuf) {
    tracing::warn!(error = %e, size = sockbuf, "TCP SetWriteBuffer failed");
  }
}

impl Dispatcher {
  pub fn new(pool: Arc<SessionPool>, sockbuf: usize) -> Self {
    Self { pool, sockbuf }
  }

  /// Accepts until `shutdown` is cancelled, returning the number of connections relayed.
  ///
  /// Stream acquisition happens inline; relays run on their own tasks and are
  /// not awaited. Per-connection failures never end the loop.
  pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> u64 {
    let mut incoming = TcpListenerStream::new(listener).take_until({
      let shutdown = shutdown.clone();
      Box::pin(async move { shutdown.cancelled().await })
    });
    let mut relayed = 0u64;

    while let Some(accepted) = incoming.next().await {
      let local = match accepted {
        Ok(local) => local,
        Err(e) => {
          tracing::warn!(error = %e, "Accept failed");
          tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
          }
        }
      };
      let peer = local
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| String::from("unknown"));
      apply_socket_buffers(&local, self.sockbuf);

      let (stream, slot) = match self.pool.acquire_stream().await {
        Ok(acquired) => acquired,
        Err(e) => {
          tracing::warn!(%peer, slot = e.slot(), error = ?e, "Dropping connection, no tunnel stream");
          drop(local);
          continue;
        }
      };
      relayed += 1;
      tracing::debug!(%peer, slot, "stream opened");

      tokio::spawn(
        async move {
          let outcome = relay(local, stream).await;
          tracing::debug!(
            sent = outcome.local_to_remote,
            received = outcome.remote_to_local,
            first_closed = %outcome.first_closed,
            "stream closed"
          );
        }
        .instrument(tracing::debug_span!("relay", %peer, slot)),
      );
    }

    tracing::info!(relayed, "Dispatcher stopped accepting");
    relayed
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use futures::future::{BoxFuture, FutureExt};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::*;
  use crate::{
    common::{
      protocol::{BoxedSession, MuxError, MuxSession},
      PoolPolicy,
    },
    pool::{SessionError, SessionSource},
    util::tunnel_stream::{boxed, BoxedStream},
  };

  /// Every stream announces its session id, then echoes
  struct EchoSession {
    id: u8,
  }

  impl MuxSession for EchoSession {
    fn open(&mut self) -> BoxFuture<'_, Result<BoxedStream, MuxError>> {
      let (near, mut far) = tokio::io::duplex(4096);
      let id = self.id;
      tokio::spawn(async move {
        far.write_all(&[id]).await?;
        let (mut r, mut w) = tokio::io::split(far);
        tokio::io::copy(&mut r, &mut w).await
      });
      futures::future::ready(Ok(boxed(near))).boxed()
    }

    fn close(self: Box<Self>) {}
  }

  #[derive(Default)]
  struct EchoSource {
    failures: AtomicUsize,
    next_id: AtomicUsize,
  }

  impl SessionSource for EchoSource {
    fn create(&self) -> BoxFuture<'static, Result<BoxedSession, SessionError>> {
      let failing = self
        .failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
      let result = if failing {
        Err(SessionError::Dial(std::io::ErrorKind::ConnectionRefused.into()))
      } else {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u8;
        Ok(Box::new(EchoSession { id }) as BoxedSession)
      };
      futures::future::ready(result).boxed()
    }
  }

  async fn start(
    pool: SessionPool,
  ) -> (
    std::net::SocketAddr,
    CancellationToken,
    tokio::task::JoinHandle<u64>,
  ) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(Arc::new(pool), 64 * 1024);
    let task = tokio::spawn(dispatcher.run(listener, shutdown.clone()));
    (addr, shutdown, task)
  }

  async fn exchange(addr: std::net::SocketAddr, message: &[u8]) -> (u8, Vec<u8>) {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    let mut id = [0u8; 1];
    conn.read_exact(&mut id).await.unwrap();
    conn.write_all(message).await.unwrap();
    let mut echoed = vec![0u8; message.len()];
    conn.read_exact(&mut echoed).await.unwrap();
    (id[0], echoed)
  }

  #[tokio::test]
  async fn connections_are_spread_round_robin() {
    let source = Arc::new(EchoSource::default());
    let pool = SessionPool::populate(source, 2, PoolPolicy::reactive(Duration::ZERO))
      .await
      .unwrap();
    let (addr, shutdown, task) = start(pool).await;

    let mut sessions = Vec::new();
    for i in 0..4 {
      let message = format!("connection {}", i).into_bytes();
      let (session, echoed) = exchange(addr, &message).await;
      assert_eq!(echoed, message);
      sessions.push(session);
    }
    assert_eq!(sessions, vec![0, 1, 0, 1]);

    shutdown.cancel();
    assert_eq!(task.await.unwrap(), 4);
  }

  #[tokio::test]
  async fn failed_acquisitions_drop_only_that_connection() {
    let source = Arc::new(EchoSource {
      failures: AtomicUsize::new(1),
      ..Default::default()
    });
    let pool = SessionPool::new(source, 1, PoolPolicy::reactive(Duration::ZERO)).unwrap();
    let (addr, shutdown, task) = start(pool).await;

    let mut refused = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), refused.read_to_end(&mut buf))
      .await
      .expect("failed connection was left open");
    assert!(read.map(|n| n == 0).unwrap_or(true));

    let (session, echoed) = exchange(addr, b"second try").await;
    assert_eq!(session, 0);
    assert_eq!(echoed, b"second try");

    shutdown.cancel();
    assert_eq!(task.await.unwrap(), 1);
  }

  #[tokio::test]
  async fn idle_relays_do_not_hold_up_the_accept_loop() {
    let source = Arc::new(EchoSource::default());
    let pool = SessionPool::populate(source, 1, PoolPolicy::reactive(Duration::ZERO))
      .await
      .unwrap();
    let (addr, shutdown, task) = start(pool).await;

    let mut idle = TcpStream::connect(addr).await.unwrap();
    let mut id = [0u8; 1];
    idle.read_exact(&mut id).await.unwrap();

    let (_, echoed) = tokio::time::timeout(Duration::from_secs(5), exchange(addr, b"meanwhile"))
      .await
      .expect("second connection was not served while the first relay was open");
    assert_eq!(echoed, b"meanwhile");

    idle.write_all(b"still relayed").await.unwrap();
    let mut late = [0u8; 13];
    idle.read_exact(&mut late).await.unwrap();
    assert_eq!(&late, b"still relayed");

    shutdown.cancel();
    assert_eq!(task.await.unwrap(), 2);
  }
}
