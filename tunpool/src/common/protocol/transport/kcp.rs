// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! KCP transport adapter over [`tokio_kcp`]
//!
//! `tokio_kcp` reads and writes bare KCP segments on a UDP socket. Each dial
//! gives it a loopback socket and relays between that and the tuned, protected
//! transport socket, sealing and opening every datagram with [`PacketCrypt`].
use std::{
  io,
  net::{Ipv4Addr, Ipv6Addr, SocketAddr},
  os::fd::AsRawFd,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};

use futures::future::{BoxFuture, FutureExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
  io::{AsyncRead, AsyncWrite, ReadBuf},
  net::UdpSocket,
  task::JoinHandle,
};
use tokio_kcp::{KcpConfig, KcpNoDelayConfig, KcpStream};
use tracing_futures::Instrument;

use super::{
  crypt::{KeyError, PacketCrypt, CRYPT_HEADER_SIZE, MTU_LIMIT},
  SocketPreparer, Transport,
};
use crate::{
  common::{BlockCipher, TransportConfig},
  util::tunnel_stream::BoxedStream,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportSetupError {
  #[error(transparent)]
  Key(#[from] KeyError),
  #[error("Forward error correction ({data}:{parity}) is not provided by the bundled KCP transport")]
  UnsupportedFec { data: usize, parity: usize },
}

/// Dials KCP over a UDP socket it creates and tunes itself
///
/// Forward error correction is not provided; construction refuses
/// configurations asking for it rather than silently dropping it.
pub struct KcpTransport {
  config: Arc<TransportConfig>,
  crypt: Arc<PacketCrypt>,
  preparer: Option<Arc<dyn SocketPreparer>>,
}

impl std::fmt::Debug for KcpTransport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("KcpTransport")
      .field("remote", &self.config.remote)
      .field("cipher", &self.crypt.kind())
      .field("protected", &self.preparer.is_some())
      .finish()
  }
}

impl KcpTransport {
  pub fn new(
    config: Arc<TransportConfig>,
    cipher: BlockCipher,
  ) -> Result<Self, TransportSetupError> {
    if config.fec_enabled() {
      return Err(TransportSetupError::UnsupportedFec {
        data: config.data_shards,
        parity: config.parity_shards,
      });
    }
    let crypt = Arc::new(PacketCrypt::new(&cipher)?);
    Ok(Self {
      config,
      crypt,
      preparer: None,
    })
  }

  /// Runs `preparer` against every socket this transport creates, before first use
  pub fn with_preparer(mut self, preparer: Arc<dyn SocketPreparer>) -> Self {
    self.preparer = Some(preparer);
    self
  }

  pub fn crypt(&self) -> &PacketCrypt {
    &self.crypt
  }

  /// KCP segments leave room for the crypt header within the configured MTU
  fn kcp_config(config: &TransportConfig) -> KcpConfig {
    let mut kcp = KcpConfig::default();
    kcp.mtu = config.mtu.saturating_sub(CRYPT_HEADER_SIZE);
    kcp.nodelay = KcpNoDelayConfig {
      nodelay: config.no_delay.nodelay,
      interval: config.no_delay.interval,
      resend: config.no_delay.resend,
      nc: config.no_delay.nc,
    };
    kcp.wnd_size = (config.send_window, config.recv_window);
    kcp.stream = true;
    kcp.flush_acks_input = config.ack_no_delay;
    kcp
  }
}

async fn resolve(remote: &str) -> io::Result<SocketAddr> {
  tokio::net::lookup_host(remote).await?.next().ok_or_else(|| {
    io::Error::new(
      io::ErrorKind::AddrNotAvailable,
      format!("No addresses were resolved for {}", remote),
    )
  })
}

/// Socket options are best-effort; failures are logged and the socket is used regardless
fn apply_socket_options(socket: &Socket, remote: &SocketAddr, config: &TransportConfig) {
  if let Err(e) = socket.set_recv_buffer_size(config.sockbuf) {
    tracing::warn!(error = %e, size = config.sockbuf, "SetReadBuffer failed");
  }
  if let Err(e) = socket.set_send_buffer_size(config.sockbuf) {
    tracing::warn!(error = %e, size = config.sockbuf, "SetWriteBuffer failed");
  }
  match remote {
    SocketAddr::V4(_) => {
      if let Err(e) = socket.set_tos(u32::from(config.dscp) << 2) {
        tracing::warn!(error = %e, dscp = config.dscp, "SetDSCP failed");
      }
    }
    SocketAddr::V6(_) if config.dscp != 0 => {
      tracing::warn!(dscp = config.dscp, "SetDSCP is not supported for IPv6 sockets");
    }
    SocketAddr::V6(_) => {}
  }
}

async fn bind_udp(
  remote: SocketAddr,
  config: &TransportConfig,
  preparer: Option<Arc<dyn SocketPreparer>>,
) -> io::Result<UdpSocket> {
  let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))?;
  socket.set_nonblocking(true)?;
  apply_socket_options(&socket, &remote, config);

  if let Some(preparer) = preparer {
    let fd = socket.as_raw_fd();
    // `socket` outlives the blocking task, keeping `fd` valid until it returns
    match tokio::task::spawn_blocking(move || preparer.prepare(fd)).await {
      Ok(Ok(())) => tracing::trace!(fd, "Transport socket prepared"),
      Ok(Err(e)) => tracing::warn!(fd, error = %e, "Failed to protect transport socket"),
      Err(e) => tracing::warn!(fd, error = %e, "Socket preparation task failed"),
    }
  }

  let local: SocketAddr = match remote {
    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
    SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
  };
  socket.bind(&local.into())?;
  let socket: std::net::UdpSocket = socket.into();
  UdpSocket::from_std(socket)
}

/// Aborts the relay task once the stream it serves is dropped
struct RelayTask(JoinHandle<()>);

impl Drop for RelayTask {
  fn drop(&mut self) {
    self.0.abort();
  }
}

/// Moves datagrams between the local KCP endpoint and the remote until aborted.
///
/// Outgoing datagrams are sealed; incoming ones that fail to open are dropped.
async fn relay_datagrams(transport: UdpSocket, local: UdpSocket, crypt: Arc<PacketCrypt>) {
  let mut outgoing = vec![0u8; CRYPT_HEADER_SIZE + MTU_LIMIT];
  let mut incoming = vec![0u8; CRYPT_HEADER_SIZE + MTU_LIMIT];
  loop {
    tokio::select! {
      received = local.recv(&mut outgoing[CRYPT_HEADER_SIZE..]) => match received {
        Ok(len) => {
          let packet = &mut outgoing[..CRYPT_HEADER_SIZE + len];
          crypt.seal(packet);
          if let Err(e) = transport.send(packet).await {
            tracing::debug!(error = %e, "Transport send failed");
          }
        }
        Err(e) => tracing::debug!(error = %e, "Local KCP endpoint receive failed"),
      },
      received = transport.recv(&mut incoming) => match received {
        Ok(len) => match crypt.open(&mut incoming[..len]) {
          Some(payload) => {
            if let Err(e) = local.send(payload).await {
              tracing::debug!(error = %e, "Local KCP endpoint send failed");
            }
          }
          None => tracing::trace!(len, "Dropping datagram that failed to open"),
        },
        Err(e) => tracing::debug!(error = %e, "Transport receive failed"),
      },
    }
  }
}

/// A KCP stream whose datagrams pass through a crypt relay
struct SealedKcpStream {
  inner: KcpStream,
  _relay: RelayTask,
}

impl AsyncRead for SealedKcpStream {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for SealedKcpStream {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl Transport for KcpTransport {
  fn dial(&self) -> BoxFuture<'static, io::Result<BoxedStream>> {
    let config = Arc::clone(&self.config);
    let crypt = Arc::clone(&self.crypt);
    let preparer = self.preparer.clone();
    async move {
      let remote = resolve(&config.remote).await?;
      let transport = bind_udp(remote, &config, preparer).await?;
      transport.connect(remote).await?;

      let loopback: SocketAddr = (Ipv4Addr::LOCALHOST, 0).into();
      let relay_end = UdpSocket::bind(loopback).await?;
      let kcp_end = UdpSocket::bind(loopback).await?;
      relay_end.connect(kcp_end.local_addr()?).await?;
      let relay_addr = relay_end.local_addr()?;
      let relay = RelayTask(tokio::spawn(
        relay_datagrams(transport, relay_end, crypt)
          .instrument(tracing::debug_span!("crypt_relay", %remote)),
      ));

      let kcp = Self::kcp_config(&config);
      let stream = KcpStream::connect_with_socket(&kcp, kcp_end, relay_addr)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))?;
      tracing::debug!(%remote, "KCP transport connected");
      Ok(Box::new(SealedKcpStream {
        inner: stream,
        _relay: relay,
      }) as BoxedStream)
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use tokio::io::AsyncWriteExt;

  use super::*;
  use crate::common::{cipher::DerivedKey, CipherKind, NoDelay};

  fn plain_cipher() -> BlockCipher {
    BlockCipher::new(CipherKind::None, &DerivedKey::derive("test"))
  }

  #[test]
  fn accepts_every_cipher() {
    let key = DerivedKey::derive("test");
    for kind in CipherKind::ALL {
      let transport =
        KcpTransport::new(Arc::new(TransportConfig::default()), BlockCipher::new(kind, &key))
          .unwrap();
      assert_eq!(transport.crypt().kind(), kind);
    }
  }

  #[test]
  fn refuses_fec() {
    let config = TransportConfig {
      data_shards: 10,
      parity_shards: 3,
      ..TransportConfig::default()
    };
    let err = KcpTransport::new(Arc::new(config), plain_cipher()).unwrap_err();
    assert_eq!(
      err,
      TransportSetupError::UnsupportedFec {
        data: 10,
        parity: 3
      }
    );
  }

  #[test]
  fn tuning_maps_onto_kcp_config() {
    let config = TransportConfig {
      mtu: 1200,
      send_window: 256,
      recv_window: 2048,
      ack_no_delay: true,
      no_delay: NoDelay::new(true, 10, 2, true),
      ..TransportConfig::default()
    };
    let kcp = KcpTransport::kcp_config(&config);
    assert_eq!(kcp.mtu, 1200 - CRYPT_HEADER_SIZE);
    assert_eq!(kcp.wnd_size, (256, 2048));
    assert!(kcp.stream);
    assert!(kcp.flush_acks_input);
    assert!(kcp.nodelay.nodelay);
    assert_eq!(kcp.nodelay.interval, 10);
    assert_eq!(kcp.nodelay.resend, 2);
    assert!(kcp.nodelay.nc);
  }

  struct RecordingPreparer(Mutex<Vec<std::os::fd::RawFd>>);

  impl SocketPreparer for RecordingPreparer {
    fn prepare(&self, fd: std::os::fd::RawFd) -> io::Result<()> {
      self.0.lock().unwrap().push(fd);
      Ok(())
    }
  }

  #[tokio::test]
  async fn dial_runs_the_socket_preparer() {
    let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let config = TransportConfig {
      remote: peer.local_addr().unwrap().to_string(),
      ..TransportConfig::default()
    };
    let preparer = Arc::new(RecordingPreparer(Mutex::new(Vec::new())));
    let transport = KcpTransport::new(Arc::new(config), plain_cipher())
      .unwrap()
      .with_preparer(preparer.clone());
    let conn = transport.dial().await.unwrap();
    drop(conn);
    let recorded = preparer.0.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0] >= 0);
  }

  #[tokio::test]
  async fn dialed_segments_leave_sealed() {
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = TransportConfig {
      remote: peer.local_addr().unwrap().to_string(),
      ..TransportConfig::default()
    };
    let cipher = BlockCipher::new(CipherKind::Aes, &DerivedKey::derive("it's a secrect"));
    let transport = KcpTransport::new(Arc::new(config), cipher.clone()).unwrap();
    let mut conn = transport.dial().await.unwrap();
    conn.write_all(b"hello over kcp").await.unwrap();
    conn.flush().await.unwrap();

    let mut datagram = vec![0u8; 2048];
    let (len, _) = tokio::time::timeout(
      std::time::Duration::from_secs(5),
      peer.recv_from(&mut datagram),
    )
    .await
    .expect("no datagram reached the remote")
    .unwrap();
    assert!(len > CRYPT_HEADER_SIZE);

    let crypt = PacketCrypt::new(&cipher).unwrap();
    let segment = crypt
      .open(&mut datagram[..len])
      .expect("datagram was not sealed with the configured cipher");
    // KCP push command follows the 4 byte conversation id
    assert_eq!(segment[4], 81);
    assert!(segment
      .windows(b"hello over kcp".len())
      .any(|w| w == b"hello over kcp"));
  }
}
