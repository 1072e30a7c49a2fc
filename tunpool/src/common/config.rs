// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Immutable configuration resolved once at startup.
use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("Unknown timing profile {0:?}; expected normal, fast, fast2, fast3 or manual")]
  UnknownProfile(String),
  #[error("Unknown pool policy {0:?}; expected proactive or reactive")]
  UnknownPolicy(String),
  #[error("Pool size must be at least 1")]
  EmptyPool,
  #[error("DSCP must fit in 6 bits, got {0}")]
  DscpOutOfRange(u8),
  #[error("MTU {0} is out of range (expected {} to {})", MIN_MTU, MAX_MTU)]
  MtuOutOfRange(usize),
}

/// Smallest MTU that still fits the crypt header and a KCP segment header
pub const MIN_MTU: usize = 70;
pub const MAX_MTU: usize = 1500;

/// KCP's no-delay/interval/resend/nc tuning tuple
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoDelay {
  pub nodelay: bool,
  /// Internal update interval in milliseconds
  pub interval: i32,
  /// Fast-retransmit trigger; 0 disables fast retransmission
  pub resend: i32,
  /// Disables congestion control when set
  pub nc: bool,
}

impl NoDelay {
  pub const fn new(nodelay: bool, interval: i32, resend: i32, nc: bool) -> Self {
    Self {
      nodelay,
      interval,
      resend,
      nc,
    }
  }
}

impl fmt::Display for NoDelay {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} {} {} {}",
      self.nodelay as u8, self.interval, self.resend, self.nc as u8
    )
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
  Normal,
  Fast,
  Fast2,
  Fast3,
  /// Use the explicitly supplied tuple untouched
  Manual,
}

impl Profile {
  /// Resolves the profile into a concrete tuple; `manual` is returned as-is for [`Profile::Manual`].
  pub fn resolve(self, manual: NoDelay) -> NoDelay {
    match self {
      Profile::Normal => NoDelay::new(false, 30, 2, true),
      Profile::Fast => NoDelay::new(false, 20, 2, true),
      Profile::Fast2 => NoDelay::new(true, 20, 2, true),
      Profile::Fast3 => NoDelay::new(true, 10, 2, true),
      Profile::Manual => manual,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      Profile::Normal => "normal",
      Profile::Fast => "fast",
      Profile::Fast2 => "fast2",
      Profile::Fast3 => "fast3",
      Profile::Manual => "manual",
    }
  }
}

impl FromStr for Profile {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "normal" => Ok(Profile::Normal),
      "fast" => Ok(Profile::Fast),
      "fast2" => Ok(Profile::Fast2),
      "fast3" => Ok(Profile::Fast3),
      "manual" => Ok(Profile::Manual),
      other => Err(ConfigError::UnknownProfile(other.to_string())),
    }
  }
}

impl fmt::Display for Profile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Names the pool's slot invalidation strategy; exactly one is active per process.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolPolicy {
  /// Slots carry an absolute expiry and are replaced once it passes, used or not.
  ProactiveExpiry { ttl: Option<Duration> },
  /// Slots are replaced only after `open` fails on them.
  ///
  /// `gc_interval` drives an optional maintenance task that never touches slot contents.
  ReactiveInvalidation { gc_interval: Option<Duration> },
}

impl PoolPolicy {
  /// `autoexpire` of zero disables expiry
  pub fn proactive(autoexpire: Duration) -> Self {
    PoolPolicy::ProactiveExpiry {
      ttl: Some(autoexpire).filter(|ttl| !ttl.is_zero()),
    }
  }

  /// `gc_interval` of zero disables the maintenance task
  pub fn reactive(gc_interval: Duration) -> Self {
    PoolPolicy::ReactiveInvalidation {
      gc_interval: Some(gc_interval).filter(|interval| !interval.is_zero()),
    }
  }

  pub fn kind(&self) -> PolicyKind {
    match self {
      PoolPolicy::ProactiveExpiry { .. } => PolicyKind::Proactive,
      PoolPolicy::ReactiveInvalidation { .. } => PolicyKind::Reactive,
    }
  }

  pub fn ttl(&self) -> Option<Duration> {
    match self {
      PoolPolicy::ProactiveExpiry { ttl } => *ttl,
      PoolPolicy::ReactiveInvalidation { .. } => None,
    }
  }

  pub fn gc_interval(&self) -> Option<Duration> {
    match self {
      PoolPolicy::ProactiveExpiry { .. } => None,
      PoolPolicy::ReactiveInvalidation { gc_interval } => *gc_interval,
    }
  }
}

impl fmt::Display for PoolPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PoolPolicy::ProactiveExpiry { ttl: Some(ttl) } => {
        write!(f, "proactive expiry after {}s", ttl.as_secs())
      }
      PoolPolicy::ProactiveExpiry { ttl: None } => f.write_str("proactive expiry (disabled)"),
      PoolPolicy::ReactiveInvalidation {
        gc_interval: Some(interval),
      } => write!(
        f,
        "reactive invalidation, maintenance every {}s",
        interval.as_secs()
      ),
      PoolPolicy::ReactiveInvalidation { gc_interval: None } => {
        f.write_str("reactive invalidation")
      }
    }
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
  Proactive,
  Reactive,
}

impl FromStr for PolicyKind {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "proactive" => Ok(PolicyKind::Proactive),
      "reactive" => Ok(PolicyKind::Reactive),
      other => Err(ConfigError::UnknownPolicy(other.to_string())),
    }
  }
}

/// Transport parameters shared by every session the factory dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
  /// Remote transport address; resolved again on every dial
  pub remote: String,
  pub data_shards: usize,
  pub parity_shards: usize,
  pub mtu: usize,
  /// Send window in packets
  pub send_window: u16,
  /// Receive window in packets
  pub recv_window: u16,
  pub dscp: u8,
  /// Socket buffer size in bytes, for both directions
  pub sockbuf: usize,
  pub keepalive: Duration,
  pub ack_no_delay: bool,
  pub no_delay: NoDelay,
}

impl TransportConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.dscp > 63 {
      return Err(ConfigError::DscpOutOfRange(self.dscp));
    }
    if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
      return Err(ConfigError::MtuOutOfRange(self.mtu));
    }
    Ok(())
  }

  /// Whether forward error correction is requested
  pub fn fec_enabled(&self) -> bool {
    self.data_shards > 0 || self.parity_shards > 0
  }
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      remote: String::from("vps:29900"),
      data_shards: 0,
      parity_shards: 0,
      mtu: 1350,
      send_window: 128,
      recv_window: 1024,
      dscp: 0,
      sockbuf: 4 * 1024 * 1024,
      keepalive: Duration::from_secs(10),
      ack_no_delay: false,
      no_delay: Profile::Fast.resolve(NoDelay::new(false, 40, 0, false)),
    }
  }
}
