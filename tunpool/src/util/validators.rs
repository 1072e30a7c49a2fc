// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use crate::common::config::{PolicyKind, Profile};

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

/// Parses a listen address; a bare `:port` binds every IPv4 interface
pub fn parse_listen_addr(v: &str) -> Result<SocketAddr> {
  if let Some(port) = v.strip_prefix(':') {
    let port = port
      .parse::<u16>()
      .map_err(|_| AnyErr::msg("Port component was not a valid u16"))?;
    return Ok((Ipv4Addr::UNSPECIFIED, port).into());
  }
  parse_socketaddr(v)
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(|e| e.into())
    .and_then(|mut items| {
      items.next().ok_or(AnyErr::msg(
        "No addresses were resolved from the given host",
      ))
    })
}

/// Checks `host:port` shape without resolving; remote names are resolved at every dial
pub fn parse_remote_addr(v: &str) -> Result<(&str, u16)> {
  match v.rsplit_once(':') {
    None => Err(AnyErr::msg("Could not match ':' in remote address")),
    Some(("", _)) => Err(AnyErr::msg("Remote address has no host component")),
    Some((host, port)) => port
      .parse::<u16>()
      .map(|port| (host, port))
      .map_err(|_| AnyErr::msg("Port component was not a valid u16")),
  }
}

pub fn validate_listen_addr(v: &str) -> Result<(), String> {
  parse_listen_addr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_remote_addr(v: &str) -> Result<(), String> {
  parse_remote_addr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_profile(v: &str) -> Result<(), String> {
  v.parse::<Profile>().map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_policy(v: &str) -> Result<(), String> {
  v.parse::<PolicyKind>().map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_pool_size(v: &str) -> Result<(), String> {
  match v.parse::<usize>() {
    Ok(0) => Err(String::from("At least one session is required")),
    Ok(_) => Ok(()),
    Err(e) => Err(e.to_string()),
  }
}

pub fn validate_dscp(v: &str) -> Result<(), String> {
  match v.parse::<u8>() {
    Ok(dscp) if dscp <= 63 => Ok(()),
    Ok(_) => Err(String::from("DSCP is a 6-bit value (0-63)")),
    Err(e) => Err(e.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bare_port_listens_on_every_interface() {
    let addr = parse_listen_addr(":12948").unwrap();
    assert_eq!(addr, "0.0.0.0:12948".parse().unwrap());
    assert_eq!(
      parse_listen_addr("127.0.0.1:80").unwrap(),
      "127.0.0.1:80".parse().unwrap()
    );
    assert!(validate_listen_addr(":http").is_err());
  }

  #[test]
  fn remote_addresses_are_not_resolved() {
    assert_eq!(parse_remote_addr("vps:29900").unwrap(), ("vps", 29900));
    assert_eq!(parse_remote_addr("[::1]:443").unwrap(), ("[::1]", 443));
    assert!(validate_remote_addr("vps").is_err());
    assert!(validate_remote_addr(":29900").is_err());
  }

  #[test]
  fn numeric_limits() {
    assert!(validate_pool_size("0").is_err());
    assert!(validate_pool_size("4").is_ok());
    assert!(validate_dscp("46").is_ok());
    assert!(validate_dscp("64").is_err());
    assert!(validate_profile("fast2").is_ok());
    assert!(validate_profile("turbo").is_err());
    assert!(validate_policy("reactive").is_ok());
  }
}
