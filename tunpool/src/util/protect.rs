// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Hands transport sockets to an external protection helper over a Unix socket
//!
//! The helper receives the descriptor as `SCM_RIGHTS` ancillary data attached
//! to a single placeholder byte and answers with a single byte once done.
use std::{
  io::{self, IoSlice, Read},
  os::{
    fd::{AsRawFd, RawFd},
    unix::net::UnixStream,
  },
  path::{Path, PathBuf},
  time::Duration,
};

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};

use crate::common::protocol::SocketPreparer;

const PLACEHOLDER: &[u8] = b"!";
pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum ProtectError {
  #[error("Failed to reach protection helper at {path:?}")]
  Connect {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("Failed to pass descriptor {fd} to protection helper")]
  Send {
    fd: RawFd,
    #[source]
    source: nix::Error,
  },
  #[error("Protection helper did not acknowledge")]
  Ack(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct UnixProtector {
  path: PathBuf,
  timeout: Duration,
}

impl UnixProtector {
  pub fn new<P: Into<PathBuf>>(path: P) -> Self {
    Self {
      path: path.into(),
      timeout: DEFAULT_HELPER_TIMEOUT,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn connect(&self) -> io::Result<UnixStream> {
    let conn = UnixStream::connect(&self.path)?;
    conn.set_read_timeout(Some(self.timeout))?;
    conn.set_write_timeout(Some(self.timeout))?;
    Ok(conn)
  }

  /// Blocks until the helper acknowledges `fd` or a timeout elapses
  pub fn protect(&self, fd: RawFd) -> Result<(), ProtectError> {
    let mut conn = self.connect().map_err(|source| ProtectError::Connect {
      path: self.path.clone(),
      source,
    })?;

    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(PLACEHOLDER)];
    sendmsg::<UnixAddr>(conn.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
      .map_err(|source| ProtectError::Send { fd, source })?;

    let mut ack = [0u8; 1];
    match conn.read(&mut ack) {
      Ok(1) => Ok(()),
      Ok(_) => Err(ProtectError::Ack(io::ErrorKind::UnexpectedEof.into())),
      Err(e) => Err(ProtectError::Ack(e)),
    }
  }
}

impl SocketPreparer for UnixProtector {
  fn prepare(&self, fd: RawFd) -> io::Result<()> {
    self
      .protect(fd)
      .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
  }
}
