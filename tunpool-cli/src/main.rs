// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use std::path::Path;
use tunpool::util;

use util::validators::{
  validate_dscp, validate_existing_file, validate_listen_addr, validate_policy,
  validate_pool_size, validate_profile, validate_remote_addr,
};

mod client;
mod config;

fn numeric<T>(v: &str) -> Result<(), String>
where
  T: std::str::FromStr,
  T::Err: std::fmt::Display,
{
  v.parse::<T>().map(|_| ()).map_err(|e| e.to_string())
}

fn value_arg(name: &'static str, default: &'static str) -> Arg<'static> {
  Arg::new(name)
    .long(name)
    .takes_value(true)
    .default_value(default)
}

fn command() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      value_arg("localaddr", ":12948")
        .short('l')
        .help("Local listen address")
        .validator(validate_listen_addr),
    )
    .arg(
      value_arg("remoteaddr", "vps:29900")
        .short('r')
        .help("Remote transport address")
        .validator(validate_remote_addr),
    )
    .arg(
      value_arg("key", "it's a secrect")
        .env("KCPTUN_KEY")
        .hide_env_values(true)
        .hide_default_value(true)
        .help("Pre-shared secret between client and server"),
    )
    .arg(
      value_arg("crypt", "aes")
        .help("aes, aes-128, aes-192, salsa20, blowfish, twofish, cast5, 3des, tea, xtea, xor, none"),
    )
    .arg(
      value_arg("mode", "fast")
        .help("Profiles: fast3, fast2, fast, normal, manual")
        .validator(validate_profile),
    )
    .arg(
      value_arg("conn", "1")
        .help("Number of pooled sessions")
        .validator(validate_pool_size),
    )
    .arg(
      value_arg("policy", "proactive")
        .help("Session invalidation policy: proactive or reactive")
        .validator(validate_policy),
    )
    .arg(
      value_arg("autoexpire", "60")
        .help("Proactive policy: seconds before a session is replaced, 0 to disable")
        .validator(numeric::<u64>),
    )
    .arg(
      value_arg("gc", "0")
        .help("Reactive policy: minutes between memory reclamation passes, 0 to disable")
        .validator(numeric::<u64>),
    )
    .arg(
      value_arg("dialtimeout", "10")
        .help("Seconds allowed to establish a session")
        .validator(numeric::<u64>),
    )
    .arg(value_arg("mtu", "1350").validator(numeric::<usize>))
    .arg(value_arg("sndwnd", "128").validator(numeric::<u16>))
    .arg(value_arg("rcvwnd", "1024").validator(numeric::<u16>))
    .arg(value_arg("datashard", "0").validator(numeric::<usize>))
    .arg(value_arg("parityshard", "0").validator(numeric::<usize>))
    .arg(value_arg("dscp", "0").validator(validate_dscp))
    .arg(
      Arg::new("nocomp")
        .long("nocomp")
        .help("Disable compression"),
    )
    .arg(
      Arg::new("acknodelay")
        .long("acknodelay")
        .help("Flush ACKs immediately")
        .hide(true),
    )
    .arg(value_arg("nodelay", "0").hide(true).validator(numeric::<i32>))
    .arg(value_arg("interval", "40").hide(true).validator(numeric::<i32>))
    .arg(value_arg("resend", "0").hide(true).validator(numeric::<i32>))
    .arg(value_arg("nc", "0").hide(true).validator(numeric::<i32>))
    .arg(
      value_arg("sockbuf", "4194304")
        .help("Socket buffer size in bytes")
        .hide(true)
        .validator(numeric::<usize>),
    )
    .arg(
      value_arg("keepalive", "10")
        .help("Seconds between yamux keepalive pings on each session, 0 to disable")
        .hide(true)
        .validator(numeric::<u64>),
    )
    .arg(
      Arg::new("path")
        .long("path")
        .takes_value(true)
        .required(false)
        .help("Unix socket of the descriptor protection helper"),
    )
    .arg(
      Arg::new("config")
        .long("config")
        .short('c')
        .takes_value(true)
        .required(false)
        .validator(validate_existing_file)
        .help("JSON config file; its keys override flags"),
    )
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tunpool=info,info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let matches = command().get_matches();
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(main_args_handler(&matches)) {
    Err(err) => {
      tracing::error!(err = ?err, "client_startup_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("client exited successfully"),
  }
}

pub async fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  let mut settings = config::Settings::from_matches(args)?;
  if let Some(path) = args.value_of("config") {
    settings = settings
      .overlay_file(Path::new(path))
      .context("Failed to apply config file")?;
  }
  Ok(settings.resolve()?)
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  let config = client_arg_handling(matches).await?;
  tracing::info!("version: {}", env!("CARGO_PKG_VERSION"));
  client::client_main(config).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn command_definition_is_consistent() {
    command().debug_assert();
  }

  #[tokio::test]
  async fn flags_resolve_into_client_args() {
    let matches = command()
      .try_get_matches_from([
        "tunpool",
        "-l",
        "127.0.0.1:9000",
        "--conn",
        "3",
        "--mode",
        "fast2",
        "--policy",
        "reactive",
        "--gc",
        "2",
        "--nocomp",
      ])
      .unwrap();
    let args = client_arg_handling(&matches).await.unwrap();
    assert_eq!(args.listen, "127.0.0.1:9000".parse().unwrap());
    assert_eq!(args.pool_size, 3);
    assert_eq!(args.profile, tunpool::common::Profile::Fast2);
    assert!(!args.compression);
    assert_eq!(
      args.policy.gc_interval(),
      Some(std::time::Duration::from_secs(120))
    );
  }

  #[test]
  fn invalid_flags_are_rejected() {
    assert!(command()
      .try_get_matches_from(["tunpool", "--conn", "0"])
      .is_err());
    assert!(command()
      .try_get_matches_from(["tunpool", "--mode", "warp"])
      .is_err());
  }
}
