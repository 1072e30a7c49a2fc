// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Cipher selection and key derivation for the transport.
//!
//! The cipher itself belongs to the transport; this module only resolves the
//! configured name and secret into a [`BlockCipher`] value once at startup.
use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use sha1::Sha1;

/// Salt used for PBKDF2 key expansion; shared with the remote end
pub const KEY_SALT: &[u8] = b"kcp-go";
pub const KEY_ITERATIONS: u32 = 4096;
pub const KEY_LEN: usize = 32;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CipherKind {
  /// AES-256
  #[default]
  #[serde(rename = "aes")]
  Aes,
  #[serde(rename = "aes-128")]
  Aes128,
  #[serde(rename = "aes-192")]
  Aes192,
  #[serde(rename = "salsa20")]
  Salsa20,
  #[serde(rename = "blowfish")]
  Blowfish,
  #[serde(rename = "twofish")]
  Twofish,
  #[serde(rename = "cast5")]
  Cast5,
  #[serde(rename = "3des")]
  TripleDes,
  #[serde(rename = "tea")]
  Tea,
  #[serde(rename = "xtea")]
  Xtea,
  #[serde(rename = "xor")]
  Xor,
  #[serde(rename = "none")]
  None,
}

impl CipherKind {
  pub const ALL: [CipherKind; 12] = [
    CipherKind::Aes,
    CipherKind::Aes128,
    CipherKind::Aes192,
    CipherKind::Salsa20,
    CipherKind::Blowfish,
    CipherKind::Twofish,
    CipherKind::Cast5,
    CipherKind::TripleDes,
    CipherKind::Tea,
    CipherKind::Xtea,
    CipherKind::Xor,
    CipherKind::None,
  ];

  /// Resolves a cipher name; unrecognized names select the default, AES-256.
  pub fn from_name(name: &str) -> CipherKind {
    Self::ALL
      .iter()
      .copied()
      .find(|kind| kind.name() == name)
      .unwrap_or_default()
  }

  pub fn name(self) -> &'static str {
    match self {
      CipherKind::Aes => "aes",
      CipherKind::Aes128 => "aes-128",
      CipherKind::Aes192 => "aes-192",
      CipherKind::Salsa20 => "salsa20",
      CipherKind::Blowfish => "blowfish",
      CipherKind::Twofish => "twofish",
      CipherKind::Cast5 => "cast5",
      CipherKind::TripleDes => "3des",
      CipherKind::Tea => "tea",
      CipherKind::Xtea => "xtea",
      CipherKind::Xor => "xor",
      CipherKind::None => "none",
    }
  }

  /// Number of leading bytes of the derived key this cipher is keyed with
  pub fn key_len(self) -> usize {
    match self {
      CipherKind::Aes128 | CipherKind::Tea | CipherKind::Xtea | CipherKind::Cast5 => 16,
      CipherKind::Aes192 | CipherKind::TripleDes => 24,
      _ => KEY_LEN,
    }
  }
}

impl fmt::Display for CipherKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Key material expanded from the pre-shared secret
#[derive(Clone)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
  pub fn derive(secret: &str) -> Self {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_sha1(secret.as_bytes(), KEY_SALT, KEY_ITERATIONS, &mut key);
    Self(key)
  }

  pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
    &self.0
  }
}

impl fmt::Debug for DerivedKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("DerivedKey(..)")
  }
}

fn pbkdf2_sha1(password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]) {
  pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, rounds, out);
}

/// Opaque cipher capability handed to the transport
#[derive(Clone)]
pub struct BlockCipher {
  kind: CipherKind,
  key: Arc<[u8]>,
}

impl BlockCipher {
  pub fn new(kind: CipherKind, key: &DerivedKey) -> Self {
    Self {
      kind,
      key: Arc::from(&key.as_bytes()[..kind.key_len()]),
    }
  }

  pub fn kind(&self) -> CipherKind {
    self.kind
  }

  pub fn key(&self) -> &[u8] {
    &self.key
  }
}

impl fmt::Debug for BlockCipher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BlockCipher")
      .field("kind", &self.kind)
      .field("key_len", &self.key.len())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // RFC 6070, test case 3
  #[test]
  fn pbkdf2_matches_reference_vector() {
    let mut out = [0u8; 20];
    pbkdf2_sha1(b"password", b"salt", 4096, &mut out);
    assert_eq!(
      out,
      [
        0x4b, 0x00, 0x79, 0x01, 0xb7, 0x65, 0x48, 0x9a, 0xbe, 0xad, 0x49, 0xd9, 0x26, 0xf7, 0x21,
        0xd0, 0x65, 0xa4, 0x29, 0xc1
      ]
    );
  }

  #[test]
  fn unknown_cipher_names_fall_back_to_aes() {
    assert_eq!(CipherKind::from_name("rot13"), CipherKind::Aes);
    assert_eq!(CipherKind::from_name("3des"), CipherKind::TripleDes);
    for kind in CipherKind::ALL {
      assert_eq!(CipherKind::from_name(kind.name()), kind);
    }
  }

  #[test]
  fn block_cipher_is_keyed_with_a_prefix_of_the_derived_key() {
    let key = DerivedKey::derive("it's a secrect");
    let tea = BlockCipher::new(CipherKind::Tea, &key);
    assert_eq!(tea.key(), &key.as_bytes()[..16]);
    let des = BlockCipher::new(CipherKind::TripleDes, &key);
    assert_eq!(des.key().len(), 24);
    let aes = BlockCipher::new(CipherKind::Aes, &key);
    assert_eq!(aes.key(), &key.as_bytes()[..]);
  }

  #[test]
  fn debug_output_hides_key_material() {
    let key = DerivedKey::derive("hunter2");
    let cipher = BlockCipher::new(CipherKind::Salsa20, &key);
    let rendered = format!("{:?} {:?}", cipher, key);
    assert!(rendered.contains("Salsa20"));
    assert!(rendered.contains("key_len: 32"));
    assert!(!rendered.contains("key:"));
  }
}
