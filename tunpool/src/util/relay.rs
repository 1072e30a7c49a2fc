// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bidirectional relay between a local connection and a tunnel stream
use std::{io, time::Duration};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

const RELAY_BUFFER_CAPACITY: usize = 1024 * 32;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  LocalToRemote,
  RemoteToLocal,
}

impl std::fmt::Display for Direction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Direction::LocalToRemote => "local->remote",
      Direction::RemoteToLocal => "remote->local",
    })
  }
}

/// What a finished relay moved, and which direction ended it
#[derive(Debug)]
pub struct RelayOutcome {
  pub local_to_remote: u64,
  pub remote_to_local: u64,
  pub first_closed: Direction,
  /// Set when the direction that ended the relay did so with an error
  pub error: Option<io::Error>,
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, transferred: &mut u64) -> io::Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  loop {
    let chunk = reader.fill_buf().await?;
    if chunk.is_empty() {
      return Ok(());
    }
    let n = chunk.len();
    writer.write_all(chunk).await?;
    reader.consume(n);
    *transferred += n as u64;
    writer.flush().await?;
  }
}

async fn close_quietly<W: AsyncWrite + Unpin>(writer: &mut W) {
  match tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
    Ok(Ok(())) => {}
    Ok(Err(e)) => tracing::trace!(error = %e, "Relay endpoint shutdown failed"),
    Err(_) => tracing::trace!("Relay endpoint shutdown timed out"),
  }
}

/// Copies in both directions until either one ends, then closes both ends.
///
/// The surviving direction is cancelled rather than drained. Errors never
/// propagate; they are logged and reported through the returned [`RelayOutcome`].
#[tracing::instrument(level = "trace", skip(local, remote))]
pub async fn relay<L, R>(local: L, remote: R) -> RelayOutcome
where
  L: AsyncRead + AsyncWrite + Unpin,
  R: AsyncRead + AsyncWrite + Unpin,
{
  let (local_r, mut local_w) = tokio::io::split(local);
  let (remote_r, mut remote_w) = tokio::io::split(remote);
  let mut local_r = BufReader::with_capacity(RELAY_BUFFER_CAPACITY, local_r);
  let mut remote_r = BufReader::with_capacity(RELAY_BUFFER_CAPACITY, remote_r);

  let (mut local_to_remote, mut remote_to_local) = (0u64, 0u64);
  let (first_closed, result) = {
    let upstream = pump(&mut local_r, &mut remote_w, &mut local_to_remote);
    let downstream = pump(&mut remote_r, &mut local_w, &mut remote_to_local);
    tokio::pin!(upstream);
    tokio::pin!(downstream);
    tracing::trace!("polling");
    tokio::select! {
      res = &mut upstream => (Direction::LocalToRemote, res),
      res = &mut downstream => (Direction::RemoteToLocal, res),
    }
  };

  close_quietly(&mut remote_w).await;
  close_quietly(&mut local_w).await;

  let error = result.err();
  if let Some(e) = &error {
    tracing::debug!(error = %e, direction = %first_closed, "Relay ended with error");
  }
  RelayOutcome {
    local_to_remote,
    remote_to_local,
    first_closed,
    error,
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::time::Duration;

  use futures::FutureExt;
  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
  use tokio::sync::Barrier;

  use super::*;

  #[tokio::test]
  async fn bridges_both_directions_and_reports_counts() {
    let (mut client, local) = duplex(2048);
    let (remote, mut server) = duplex(2048);
    let relay_task = tokio::spawn(relay(local, remote));

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    server.write_all(b"pong!").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong!");

    client.shutdown().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), relay_task)
      .await
      .expect("relay did not finish")
      .unwrap();
    assert_eq!(outcome.first_closed, Direction::LocalToRemote);
    assert_eq!(outcome.local_to_remote, 4);
    assert_eq!(outcome.remote_to_local, 5);
    assert!(outcome.error.is_none());

    // Both ends observe the closure
    let mut rest = Vec::new();
    assert_eq!(server.read_to_end(&mut rest).await.unwrap(), 0);
    assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn remote_closure_closes_the_local_side() {
    let (mut client, local) = duplex(2048);
    let (remote, server) = duplex(2048);
    let relay_task = tokio::spawn(relay(local, remote));
    drop(server);

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
      .await
      .expect("local side was left open")
      .unwrap();
    let outcome = relay_task.await.unwrap();
    assert_eq!(outcome.first_closed, Direction::RemoteToLocal);
  }

  // Given input to one side terminating, ensure that a source stream closing also closes its output
  #[tokio::test]
  async fn independent_directional_closure() {
    let request_input = Vec::from(*b"request").repeat(128);
    let response_input = Vec::from(*b"response").repeat(128);
    let (mut client, local) = duplex(2048);
    let (remote, mut server) = duplex(2048);

    let all_relaying_ready = Arc::new(Barrier::new(3));
    let all_relay_exit = Arc::new(Barrier::new(3));

    let a = tokio::task::spawn({
      let all_relaying_ready = all_relaying_ready.clone();
      let all_relay_exit = all_relay_exit.clone();
      let request_len = request_input.len();
      async move {
        all_relaying_ready.wait().await;
        client.write_all(&request_input).await.unwrap();
        client.shutdown().await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        all_relay_exit.wait().await;
        request_len
      }
    });

    let b = tokio::task::spawn({
      let all_relaying_ready = all_relaying_ready.clone();
      let all_relay_exit = all_relay_exit.clone();
      async move {
        all_relaying_ready.wait().await;
        server.write_all(&response_input).await.unwrap();
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        drop(server);
        all_relay_exit.wait().await;
        buf.len()
      }
    });

    let relaying = tokio::task::spawn({
      let all_relaying_ready = all_relaying_ready.clone();
      let all_relay_exit = all_relay_exit.clone();
      async move {
        let relay_future = relay(local, remote);
        all_relaying_ready.wait().await;
        let outcome = relay_future.await;
        all_relay_exit.wait().await;
        outcome
      }
    });

    use futures::future::Either;
    match futures::future::select(
      futures::future::try_join3(a, b, relaying).boxed(),
      tokio::time::sleep(Duration::from_secs(10)).boxed(),
    )
    .await
    {
      Either::Left((Ok((sent, received, outcome)), _)) => {
        assert_eq!(sent, received);
        assert_eq!(outcome.local_to_remote, sent as u64);
      }
      Either::Left((Err(e), _)) => panic!("Error running unit test: {:#?}", e),
      Either::Right(_) => panic!("Timeout reached running async test"),
    }
  }
}
