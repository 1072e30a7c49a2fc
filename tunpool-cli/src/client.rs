// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tunpool::{
  client::Dispatcher,
  common::{
    protocol::{
      mux::{YamuxConnector, YamuxSettings},
      transport::KcpTransport,
    },
    BlockCipher, PoolPolicy, Profile, TransportConfig,
  },
  pool::{Maintenance, SessionFactory, SessionPool},
  util::protect::UnixProtector,
};

#[derive(Clone, Debug)]
pub struct ClientArgs {
  pub listen: SocketAddr,
  pub transport: TransportConfig,
  pub cipher: BlockCipher,
  pub profile: Profile,
  pub pool_size: usize,
  pub policy: PoolPolicy,
  pub compression: bool,
  pub dial_timeout: Duration,
  pub protect_path: Option<PathBuf>,
}

fn log_effective_config(listener: &TcpListener, config: &ClientArgs) {
  let transport = &config.transport;
  match listener.local_addr() {
    Ok(addr) => tracing::info!("listening on: {}", addr),
    Err(_) => tracing::info!("listening on: {}", config.listen),
  }
  tracing::info!("encryption: {}", config.cipher.kind());
  tracing::info!("mode: {}", config.profile);
  tracing::info!("nodelay parameters: {}", transport.no_delay);
  tracing::info!("remote address: {}", transport.remote);
  tracing::info!("sndwnd: {} rcvwnd: {}", transport.send_window, transport.recv_window);
  tracing::info!("compression: {}", config.compression);
  tracing::info!("mtu: {}", transport.mtu);
  tracing::info!(
    "datashard: {} parityshard: {}",
    transport.data_shards,
    transport.parity_shards
  );
  tracing::info!("acknodelay: {}", transport.ack_no_delay);
  tracing::info!("dscp: {}", transport.dscp);
  tracing::info!("sockbuf: {}", transport.sockbuf);
  tracing::info!("keepalive: {}", transport.keepalive.as_secs());
  tracing::info!("conn: {}", config.pool_size);
  tracing::info!("policy: {}", config.policy);
  tracing::info!("dialtimeout: {}", config.dial_timeout.as_secs());
  if let Some(path) = &config.protect_path {
    tracing::info!("protect path: {}", path.display());
  }
}

pub async fn client_main(config: ClientArgs) -> Result<()> {
  let listener = TcpListener::bind(config.listen)
    .await
    .with_context(|| format!("Failed to bind local listener on {}", config.listen))?;
  log_effective_config(&listener, &config);

  let transport_config = Arc::new(config.transport.clone());
  let mut transport = KcpTransport::new(Arc::clone(&transport_config), config.cipher.clone())
    .context("Failed to set up the transport")?;
  if let Some(path) = &config.protect_path {
    transport = transport.with_preparer(Arc::new(UnixProtector::new(path)));
  }
  let connector = YamuxConnector::new(YamuxSettings::new(
    transport_config.sockbuf,
    transport_config.keepalive,
  ));
  let factory = SessionFactory::new(Arc::new(transport), Arc::new(connector))
    .with_compression(config.compression)
    .with_dial_timeout(config.dial_timeout);

  let pool = Arc::new(
    SessionPool::populate(Arc::new(factory), config.pool_size, config.policy)
      .await
      .context("Failed to establish initial sessions")?,
  );

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::info!("Interrupt received, shutting down");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  let maintenance = config.policy.gc_interval().map(|interval| {
    Maintenance::spawn(
      Arc::clone(&pool),
      interval,
      Maintenance::default_reclaim(),
      shutdown.clone(),
    )
  });

  let dispatcher = Dispatcher::new(Arc::clone(&pool), transport_config.sockbuf);
  dispatcher.run(listener, shutdown.clone()).await;

  if let Some(maintenance) = maintenance {
    if let Err(e) = maintenance.await {
      tracing::warn!(error = %e, "Maintenance task failed");
    }
  }
  pool.shutdown().await;
  sigint_handler_task.abort();
  tracing::info!("Disconnecting...");
  Ok(())
}
