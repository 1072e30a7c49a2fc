// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Periodic memory reclamation alongside a reactively invalidated pool
use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{SessionPool, SlotState};

/// A reclamation pass; run from the maintenance task on every tick
pub type Reclaim = Arc<dyn Fn() + Send + Sync>;

/// Returns freed heap pages to the operating system where the allocator allows it
pub fn release_free_memory() {
  #[cfg(all(target_os = "linux", target_env = "gnu"))]
  unsafe {
    libc::malloc_trim(0);
  }
}

pub struct Maintenance;

impl Maintenance {
  /// The default reclamation pass
  pub fn default_reclaim() -> Reclaim {
    Arc::new(release_free_memory)
  }

  /// Runs `reclaim` every `interval` until `shutdown` is cancelled.
  ///
  /// Slot contents are only observed, never modified.
  pub fn spawn(
    pool: Arc<SessionPool>,
    interval: Duration,
    reclaim: Reclaim,
    shutdown: CancellationToken,
  ) -> JoinHandle<()> {
    tokio::spawn(
      async move {
        let first = match Instant::now().checked_add(interval) {
          Some(first) => first,
          None => {
            tracing::warn!(?interval, "Maintenance interval is out of range; no passes will run");
            shutdown.cancelled().await;
            return;
          }
        };
        let mut ticks = tokio::time::interval_at(first, interval);
        loop {
          tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticks.tick() => {
              reclaim();
              let snapshot = pool.snapshot().await;
              let live = snapshot
                .iter()
                .filter(|slot| slot.state == SlotState::Live)
                .count();
              tracing::debug!(live, size = snapshot.len(), "Maintenance pass complete");
            }
          }
        }
        tracing::debug!("Maintenance task stopped");
      }
      .instrument(tracing::debug_span!("pool_maintenance", ?interval)),
    )
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;
  use crate::{common::PoolPolicy, pool::tests::ScriptedSource};

  #[tokio::test(start_paused = true)]
  async fn reclaims_on_every_tick_until_cancelled() {
    let source = ScriptedSource::healthy();
    let pool = Arc::new(
      SessionPool::populate(source.clone(), 2, PoolPolicy::reactive(Duration::from_secs(60)))
        .await
        .unwrap(),
    );
    let passes = Arc::new(AtomicUsize::new(0));
    let reclaim: Reclaim = {
      let passes = passes.clone();
      Arc::new(move || {
        passes.fetch_add(1, Ordering::SeqCst);
      })
    };
    let shutdown = CancellationToken::new();
    let task = Maintenance::spawn(
      pool.clone(),
      Duration::from_secs(60),
      reclaim,
      shutdown.clone(),
    );

    tokio::time::sleep(Duration::from_secs(185)).await;
    assert_eq!(passes.load(Ordering::SeqCst), 3);

    shutdown.cancel();
    task.await.unwrap();
    assert!(source.ledger().closed.is_empty());
    assert_eq!(
      pool
        .snapshot()
        .await
        .iter()
        .filter(|slot| slot.state == SlotState::Live)
        .count(),
      2
    );
  }

  #[tokio::test(start_paused = true)]
  async fn out_of_range_intervals_never_reclaim() {
    let pool = Arc::new(
      SessionPool::populate(ScriptedSource::healthy(), 1, PoolPolicy::reactive(Duration::MAX))
        .await
        .unwrap(),
    );
    let passes = Arc::new(AtomicUsize::new(0));
    let reclaim: Reclaim = {
      let passes = passes.clone();
      Arc::new(move || {
        passes.fetch_add(1, Ordering::SeqCst);
      })
    };
    let shutdown = CancellationToken::new();
    let task = Maintenance::spawn(pool, Duration::MAX, reclaim, shutdown.clone());
    tokio::time::sleep(Duration::from_secs(3600)).await;
    shutdown.cancel();
    task.await.unwrap();
    assert_eq!(passes.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn default_reclaim_is_callable() {
    (Maintenance::default_reclaim())();
  }
}
