// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::BoxFuture;

use crate::util::tunnel_stream::BoxedStream;

pub mod yamux;

pub use self::yamux::{YamuxConnector, YamuxSettings};

#[derive(thiserror::Error, Debug)]
pub enum MuxError {
  #[error("Mux session closed")]
  Closed,
  #[error("Mux protocol failure: {0}")]
  Protocol(String),
  #[error("Mux I/O failure")]
  Io(
    #[from]
    #[source]
    std::io::Error,
  ),
}

/// A client-side multiplexed session able to open independent streams.
///
/// Closing consumes the session, so a session can only ever be closed once.
pub trait MuxSession: Send {
  fn open(&mut self) -> BoxFuture<'_, Result<BoxedStream, MuxError>>;

  /// Stops the session; streams already handed out are not forcibly cut by this call.
  fn close(self: Box<Self>);
}

pub type BoxedSession = Box<dyn MuxSession + 'static>;

/// Negotiates the client role of a mux protocol over an established connection
pub trait MuxConnector: Send + Sync {
  fn client(&self, conn: BoxedStream) -> BoxFuture<'static, Result<BoxedSession, MuxError>>;
}
