// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Raw settings gathered from flags and an optional JSON file, resolved into [`ClientArgs`]
use std::{
  net::SocketAddr,
  path::{Path, PathBuf},
  time::Duration,
};

use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use tunpool::{
  common::{
    cipher::DerivedKey,
    config::{ConfigError, PolicyKind},
    BlockCipher, CipherKind, NoDelay, PoolPolicy, Profile, TransportConfig,
  },
  util::validators::{parse_listen_addr, parse_remote_addr},
};

use crate::client::ClientArgs;

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
  #[error("Failed to read config file {0:?}")]
  Read(PathBuf, #[source] std::io::Error),
  #[error("Malformed config file {0:?}")]
  Parse(PathBuf, #[source] serde_json::Error),
  #[error("Config file {0:?} must hold a JSON object")]
  NotAnObject(PathBuf),
  #[error("Invalid value for {field}: {reason}")]
  Invalid { field: &'static str, reason: String },
  #[error(transparent)]
  Config(#[from] ConfigError),
}

/// One field per flag; JSON config keys use the same names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub localaddr: String,
  pub remoteaddr: String,
  pub key: String,
  pub crypt: String,
  pub mode: Profile,
  pub conn: usize,
  pub policy: PolicyKind,
  pub autoexpire: u64,
  pub gc: u64,
  pub dialtimeout: u64,
  pub mtu: usize,
  pub sndwnd: u16,
  pub rcvwnd: u16,
  pub datashard: usize,
  pub parityshard: usize,
  pub dscp: u8,
  pub nocomp: bool,
  pub acknodelay: bool,
  pub nodelay: i32,
  pub interval: i32,
  pub resend: i32,
  pub nc: i32,
  pub sockbuf: usize,
  pub keepalive: u64,
  pub path: Option<PathBuf>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      localaddr: String::from(":12948"),
      remoteaddr: String::from("vps:29900"),
      key: String::from("it's a secrect"),
      crypt: String::from("aes"),
      mode: Profile::Fast,
      conn: 1,
      policy: PolicyKind::Proactive,
      autoexpire: 60,
      gc: 0,
      dialtimeout: 10,
      mtu: 1350,
      sndwnd: 128,
      rcvwnd: 1024,
      datashard: 0,
      parityshard: 0,
      dscp: 0,
      nocomp: false,
      acknodelay: false,
      nodelay: 0,
      interval: 40,
      resend: 0,
      nc: 0,
      sockbuf: 4194304,
      keepalive: 10,
      path: None,
    }
  }
}

fn parsed<T>(args: &ArgMatches, field: &'static str) -> Result<T, SettingsError>
where
  T: std::str::FromStr,
  T::Err: std::fmt::Display,
{
  let raw = args
    .value_of(field)
    .ok_or_else(|| SettingsError::Invalid {
      field,
      reason: String::from("missing value"),
    })?;
  raw.parse::<T>().map_err(|e| SettingsError::Invalid {
    field,
    reason: e.to_string(),
  })
}

impl Settings {
  /// Reads every flag; all flags carry defaults, so each is present
  pub fn from_matches(args: &ArgMatches) -> Result<Self, SettingsError> {
    Ok(Self {
      localaddr: parsed(args, "localaddr")?,
      remoteaddr: parsed(args, "remoteaddr")?,
      key: parsed(args, "key")?,
      crypt: parsed(args, "crypt")?,
      mode: parsed(args, "mode")?,
      conn: parsed(args, "conn")?,
      policy: parsed(args, "policy")?,
      autoexpire: parsed(args, "autoexpire")?,
      gc: parsed(args, "gc")?,
      dialtimeout: parsed(args, "dialtimeout")?,
      mtu: parsed(args, "mtu")?,
      sndwnd: parsed(args, "sndwnd")?,
      rcvwnd: parsed(args, "rcvwnd")?,
      datashard: parsed(args, "datashard")?,
      parityshard: parsed(args, "parityshard")?,
      dscp: parsed(args, "dscp")?,
      nocomp: args.is_present("nocomp"),
      acknodelay: args.is_present("acknodelay"),
      nodelay: parsed(args, "nodelay")?,
      interval: parsed(args, "interval")?,
      resend: parsed(args, "resend")?,
      nc: parsed(args, "nc")?,
      sockbuf: parsed(args, "sockbuf")?,
      keepalive: parsed(args, "keepalive")?,
      path: args.value_of("path").map(PathBuf::from),
    })
  }

  /// Keys present in the JSON object replace the current values; absent keys keep them
  pub fn overlay_json(self, json: &str, origin: &Path) -> Result<Self, SettingsError> {
    let overrides: serde_json::Value = serde_json::from_str(json)
      .map_err(|e| SettingsError::Parse(origin.to_path_buf(), e))?;
    let overrides = match overrides {
      serde_json::Value::Object(map) => map,
      _ => return Err(SettingsError::NotAnObject(origin.to_path_buf())),
    };
    let mut merged = match serde_json::to_value(&self)
      .map_err(|e| SettingsError::Parse(origin.to_path_buf(), e))?
    {
      serde_json::Value::Object(map) => map,
      _ => return Err(SettingsError::NotAnObject(origin.to_path_buf())),
    };
    merged.extend(overrides);
    serde_json::from_value(serde_json::Value::Object(merged))
      .map_err(|e| SettingsError::Parse(origin.to_path_buf(), e))
  }

  pub fn overlay_file(self, path: &Path) -> Result<Self, SettingsError> {
    let json =
      std::fs::read_to_string(path).map_err(|e| SettingsError::Read(path.to_path_buf(), e))?;
    self.overlay_json(&json, path)
  }

  fn no_delay(&self) -> NoDelay {
    self.mode.resolve(NoDelay::new(
      self.nodelay != 0,
      self.interval,
      self.resend,
      self.nc != 0,
    ))
  }

  /// `gc` is given in minutes
  pub fn policy(&self) -> Result<PoolPolicy, SettingsError> {
    Ok(match self.policy {
      PolicyKind::Proactive => PoolPolicy::proactive(Duration::from_secs(self.autoexpire)),
      PolicyKind::Reactive => {
        let seconds = self.gc.checked_mul(60).ok_or_else(|| SettingsError::Invalid {
          field: "gc",
          reason: format!("{} minutes is out of range", self.gc),
        })?;
        PoolPolicy::reactive(Duration::from_secs(seconds))
      }
    })
  }

  pub fn resolve(&self) -> Result<ClientArgs, SettingsError> {
    let listen: SocketAddr =
      parse_listen_addr(&self.localaddr).map_err(|e| SettingsError::Invalid {
        field: "localaddr",
        reason: e.to_string(),
      })?;
    parse_remote_addr(&self.remoteaddr).map_err(|e| SettingsError::Invalid {
      field: "remoteaddr",
      reason: e.to_string(),
    })?;
    if self.conn == 0 {
      return Err(ConfigError::EmptyPool.into());
    }

    let transport = TransportConfig {
      remote: self.remoteaddr.clone(),
      data_shards: self.datashard,
      parity_shards: self.parityshard,
      mtu: self.mtu,
      send_window: self.sndwnd,
      recv_window: self.rcvwnd,
      dscp: self.dscp,
      sockbuf: self.sockbuf,
      keepalive: Duration::from_secs(self.keepalive),
      ack_no_delay: self.acknodelay,
      no_delay: self.no_delay(),
    };
    transport.validate()?;

    let cipher = BlockCipher::new(CipherKind::from_name(&self.crypt), &DerivedKey::derive(&self.key));

    Ok(ClientArgs {
      listen,
      transport,
      cipher,
      profile: self.mode,
      pool_size: self.conn,
      policy: self.policy()?,
      compression: !self.nocomp,
      dial_timeout: Duration::from_secs(self.dialtimeout),
      protect_path: self.path.clone(),
    })
  }
}
