// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Fixed-size pool of mux sessions, assigned to connections by round robin
//!
//! Each slot sits behind its own async mutex, so replacing a broken or expired
//! session only stalls connections rotated onto that slot.
use std::{
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  time::Duration,
};

use tokio::{sync::Mutex, time::Instant};

use crate::{
  common::{
    config::ConfigError,
    protocol::{BoxedSession, MuxError},
    PoolPolicy,
  },
  util::tunnel_stream::BoxedStream,
};

pub mod factory;
pub mod maintenance;

pub use self::factory::{SessionError, SessionFactory, SessionSource};
pub use self::maintenance::Maintenance;

#[derive(thiserror::Error, Debug)]
pub enum AcquireError {
  #[error("Failed to create a session for slot {slot}")]
  Create {
    slot: usize,
    #[source]
    source: SessionError,
  },
  #[error("Failed to open a stream on slot {slot}")]
  Open {
    slot: usize,
    #[source]
    source: MuxError,
  },
}

impl AcquireError {
  pub fn slot(&self) -> usize {
    match self {
      AcquireError::Create { slot, .. } | AcquireError::Open { slot, .. } => *slot,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum PopulateError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("Failed to create the initial session for slot {slot}")]
  Create {
    slot: usize,
    #[source]
    source: SessionError,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
  Empty,
  Live,
  /// Holds a session past its expiry; replaced on next use
  Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
  pub index: usize,
  pub state: SlotState,
  pub age: Option<Duration>,
}

#[derive(Default)]
pub struct PoolSlot {
  session: Option<BoxedSession>,
  created_at: Option<Instant>,
  expires_at: Option<Instant>,
}

impl std::fmt::Debug for PoolSlot {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PoolSlot")
      .field("live", &self.session.is_some())
      .field("created_at", &self.created_at)
      .field("expires_at", &self.expires_at)
      .finish()
  }
}

impl PoolSlot {
  fn state(&self, now: Instant) -> SlotState {
    match (&self.session, self.expires_at) {
      (None, _) => SlotState::Empty,
      (Some(_), Some(expiry)) if now >= expiry => SlotState::Stale,
      (Some(_), _) => SlotState::Live,
    }
  }

  fn install(&mut self, session: BoxedSession, now: Instant, ttl: Option<Duration>) {
    debug_assert!(self.session.is_none(), "slot replaced without retiring");
    self.session = Some(session);
    self.created_at = Some(now);
    // A ttl beyond the clock's range never expires
    self.expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
  }

  /// Closes the held session, if any, leaving the slot empty
  fn retire(&mut self) -> bool {
    self.created_at = None;
    self.expires_at = None;
    match self.session.take() {
      Some(session) => {
        session.close();
        true
      }
      None => false,
    }
  }

  async fn open(&mut self) -> Result<BoxedStream, MuxError> {
    match self.session.as_mut() {
      Some(session) => session.open().await,
      None => Err(MuxError::Closed),
    }
  }

  fn snapshot(&self, index: usize, now: Instant) -> SlotSnapshot {
    SlotSnapshot {
      index,
      state: self.state(now),
      age: self.created_at.map(|created| now.saturating_duration_since(created)),
    }
  }
}

pub struct SessionPool {
  slots: Box<[Mutex<PoolSlot>]>,
  rotation: AtomicUsize,
  source: Arc<dyn SessionSource>,
  policy: PoolPolicy,
}

impl std::fmt::Debug for SessionPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionPool")
      .field("size", &self.slots.len())
      .field("policy", &self.policy)
      .finish_non_exhaustive()
  }
}

impl SessionPool {
  /// Creates a pool with every slot empty; slots fill on first use
  pub fn new(
    source: Arc<dyn SessionSource>,
    size: usize,
    policy: PoolPolicy,
  ) -> Result<Self, ConfigError> {
    if size == 0 {
      return Err(ConfigError::EmptyPool);
    }
    let slots = (0..size)
      .map(|_| Mutex::new(PoolSlot::default()))
      .collect::<Vec<_>>()
      .into_boxed_slice();
    Ok(Self {
      slots,
      rotation: AtomicUsize::new(0),
      source,
      policy,
    })
  }

  /// Creates a pool and fills every slot before returning.
  ///
  /// Sessions are created one at a time; if any fails, the ones already
  /// created are closed and the failure is returned.
  pub async fn populate(
    source: Arc<dyn SessionSource>,
    size: usize,
    policy: PoolPolicy,
  ) -> Result<Self, PopulateError> {
    let pool = Self::new(source, size, policy)?;
    let mut created = Vec::with_capacity(size);
    for slot in 0..size {
      match pool.source.create().await {
        Ok(session) => created.push(session),
        Err(source) => {
          tracing::error!(slot, error = %source, "Initial session creation failed");
          for session in created {
            session.close();
          }
          return Err(PopulateError::Create { slot, source });
        }
      }
    }
    let now = Instant::now();
    for (slot, session) in pool.slots.iter().zip(created) {
      slot.lock().await.install(session, now, policy.ttl());
    }
    tracing::info!(size, %policy, "Session pool populated");
    Ok(pool)
  }

  pub fn size(&self) -> usize {
    self.slots.len()
  }

  pub fn policy(&self) -> PoolPolicy {
    self.policy
  }

  async fn refill(&self, slot: &mut PoolSlot, index: usize) -> Result<(), AcquireError> {
    match self.source.create().await {
      Ok(session) => {
        slot.install(session, Instant::now(), self.policy.ttl());
        tracing::debug!(slot = index, "Session created");
        Ok(())
      }
      Err(source) => Err(AcquireError::Create {
        slot: index,
        source,
      }),
    }
  }

  /// Opens a stream on the next slot in rotation, returning it with the slot index.
  ///
  /// An empty or expired slot is refilled first. A failed `open` replaces the
  /// session once and retries; a second failure closes the replacement and
  /// leaves the slot empty.
  pub async fn acquire_stream(&self) -> Result<(BoxedStream, usize), AcquireError> {
    let index = self.rotation.fetch_add(1, Ordering::Relaxed) % self.slots.len();
    let mut slot = self.slots[index].lock().await;

    match slot.state(Instant::now()) {
      SlotState::Live => {}
      SlotState::Empty => self.refill(&mut slot, index).await?,
      SlotState::Stale => {
        tracing::info!(slot = index, "autoexpired");
        slot.retire();
        self.refill(&mut slot, index).await?;
      }
    }

    let failure = match slot.open().await {
      Ok(stream) => return Ok((stream, index)),
      Err(e) => e,
    };
    tracing::warn!(slot = index, error = %failure, "Stream open failed, replacing session");
    slot.retire();
    self.refill(&mut slot, index).await?;

    match slot.open().await {
      Ok(stream) => Ok((stream, index)),
      Err(source) => {
        slot.retire();
        Err(AcquireError::Open {
          slot: index,
          source,
        })
      }
    }
  }

  /// Closes every live session and empties the slots
  pub async fn shutdown(&self) {
    let mut closed = 0usize;
    for slot in self.slots.iter() {
      if slot.lock().await.retire() {
        closed += 1;
      }
    }
    tracing::info!(closed, "Session pool shut down");
  }

  pub async fn snapshot(&self) -> Vec<SlotSnapshot> {
    let mut snapshots = Vec::with_capacity(self.slots.len());
    for (index, slot) in self.slots.iter().enumerate() {
      let slot = slot.lock().await;
      snapshots.push(slot.snapshot(index, Instant::now()));
    }
    snapshots
  }
}
