// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Transparent compression in the snappy framing format
//!
//! Every write is emitted as complete frames, so a peer never waits on data
//! held back by the compressor. Checksums are written but not verified on read.
use std::{
  io::{self, Write},
  pin::Pin,
  task::{Context, Poll},
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio_util::{
  codec::{Decoder, FramedRead},
  io::StreamReader,
};

const STREAM_IDENTIFIER: &[u8] = b"\xff\x06\x00\x00sNaPpY";
const CHUNK_HEADER_LEN: usize = 4;
const CHECKSUM_LEN: usize = 4;

const CHUNK_STREAM_IDENTIFIER: u8 = 0xff;
const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;

/// Splits a snappy-framed byte stream into its decompressed payloads
pub struct SnappyFrameDecoder {
  raw: snap::raw::Decoder,
}

impl std::fmt::Debug for SnappyFrameDecoder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SnappyFrameDecoder").finish_non_exhaustive()
  }
}

impl SnappyFrameDecoder {
  pub fn new() -> Self {
    Self {
      raw: snap::raw::Decoder::new(),
    }
  }
}

impl Default for SnappyFrameDecoder {
  fn default() -> Self {
    Self::new()
  }
}

fn invalid_data(message: String) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, message)
}

impl Decoder for SnappyFrameDecoder {
  type Item = Bytes;
  type Error = io::Error;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    loop {
      if src.len() < CHUNK_HEADER_LEN {
        return Ok(None);
      }
      let kind = src[0];
      let len = usize::from(src[1]) | usize::from(src[2]) << 8 | usize::from(src[3]) << 16;
      if src.len() < CHUNK_HEADER_LEN + len {
        src.reserve(CHUNK_HEADER_LEN + len - src.len());
        return Ok(None);
      }
      src.advance(CHUNK_HEADER_LEN);
      let mut body = src.split_to(len).freeze();

      let payload = match kind {
        CHUNK_STREAM_IDENTIFIER => {
          if body[..] != STREAM_IDENTIFIER[CHUNK_HEADER_LEN..] {
            return Err(invalid_data("Malformed snappy stream identifier".into()));
          }
          continue;
        }
        CHUNK_COMPRESSED | CHUNK_UNCOMPRESSED if len < CHECKSUM_LEN => {
          return Err(invalid_data(format!("Snappy chunk of {} bytes lacks a checksum", len)));
        }
        CHUNK_COMPRESSED => {
          body.advance(CHECKSUM_LEN);
          let decompressed = self
            .raw
            .decompress_vec(&body)
            .map_err(|e| invalid_data(e.to_string()))?;
          Bytes::from(decompressed)
        }
        CHUNK_UNCOMPRESSED => {
          body.advance(CHECKSUM_LEN);
          body
        }
        0x02..=0x7f => {
          return Err(invalid_data(format!("Unskippable snappy chunk type {:#04x}", kind)));
        }
        // Padding and reserved skippable chunks
        _ => continue,
      };
      if !payload.is_empty() {
        return Ok(Some(payload));
      }
    }
  }
}

/// Compressing decorator over any duplex stream
pub struct CompStream<S> {
  reader: StreamReader<FramedRead<ReadHalf<S>, SnappyFrameDecoder>, Bytes>,
  writer: WriteHalf<S>,
  pending: Vec<u8>,
  written: usize,
  identified: bool,
}

impl<S> std::fmt::Debug for CompStream<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CompStream")
      .field("pending", &(self.pending.len() - self.written))
      .finish_non_exhaustive()
  }
}

impl<S> CompStream<S>
where
  S: AsyncRead + AsyncWrite,
{
  pub fn new(inner: S) -> Self {
    let (read, write) = tokio::io::split(inner);
    Self {
      reader: StreamReader::new(FramedRead::new(read, SnappyFrameDecoder::new())),
      writer: write,
      pending: Vec::new(),
      written: 0,
      identified: false,
    }
  }

  fn encode(&mut self, buf: &[u8]) -> io::Result<()> {
    self.pending.clear();
    self.written = 0;
    {
      let mut encoder = snap::write::FrameEncoder::new(&mut self.pending);
      encoder.write_all(buf)?;
      encoder.flush()?;
    }
    if self.identified {
      // Each encoder opens with the identifier; the peer only expects it once
      self.written = STREAM_IDENTIFIER.len();
    }
    self.identified = true;
    Ok(())
  }

  fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    while self.written < self.pending.len() {
      let n = futures::ready!(
        Pin::new(&mut self.writer).poll_write(cx, &self.pending[self.written..])
      )?;
      if n == 0 {
        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
      }
      self.written += n;
    }
    self.pending.clear();
    self.written = 0;
    Poll::Ready(Ok(()))
  }
}

impl<S> AsyncRead for CompStream<S>
where
  S: AsyncRead + AsyncWrite,
{
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
  }
}

impl<S> AsyncWrite for CompStream<S>
where
  S: AsyncRead + AsyncWrite,
{
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    let this = self.get_mut();
    futures::ready!(this.poll_drain(cx))?;
    if buf.is_empty() {
      return Poll::Ready(Ok(0));
    }
    this.encode(buf)?;
    // The input is accepted once encoded; whatever cannot be written now goes out on the next call
    if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
      return Poll::Ready(Err(e));
    }
    Poll::Ready(Ok(buf.len()))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    futures::ready!(this.poll_drain(cx))?;
    Pin::new(&mut this.writer).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    futures::ready!(this.poll_drain(cx))?;
    Pin::new(&mut this.writer).poll_shutdown(cx)
  }
}
