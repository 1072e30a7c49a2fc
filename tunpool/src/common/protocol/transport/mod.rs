// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{io, os::fd::RawFd};

use futures::future::BoxFuture;

use crate::util::tunnel_stream::BoxedStream;

pub mod crypt;
pub mod kcp;

pub use self::{
  crypt::PacketCrypt,
  kcp::{KcpTransport, TransportSetupError},
};

/// Dials the remote transport endpoint.
///
/// Implementations are constructed with the remote address, tuning and cipher
/// already bound; every call produces an independent connection.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
  fn dial(&self) -> BoxFuture<'static, io::Result<BoxedStream>>;
}

/// Hook run against a transport socket after creation and before it is used.
///
/// Called from a blocking context.
pub trait SocketPreparer: Send + Sync {
  fn prepare(&self, fd: RawFd) -> io::Result<()>;
}
