// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream abstracting over transport connections, mux streams and memory streams
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {
  fn as_dyn_mut<'a>(self: &'a mut Self) -> &'a mut dyn TunnelStream
  where
    Self: Sized,
  {
    self
  }
}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased [`TunnelStream`]; dropping it closes the underlying stream
pub type BoxedStream = Box<dyn TunnelStream + 'static>;

pub fn boxed<S: TunnelStream + 'static>(stream: S) -> BoxedStream {
  Box::new(stream)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn boxed_streams_stay_duplex() {
    let (near, far) = tokio::io::duplex(64);
    let (mut near, mut far) = (boxed(near), boxed(far));
    near.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    drop(far);
    let mut rest = Vec::new();
    assert_eq!(near.as_dyn_mut().read_to_end(&mut rest).await.unwrap(), 0);
  }
}
