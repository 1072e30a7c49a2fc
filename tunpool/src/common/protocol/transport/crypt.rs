// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-datagram packet crypt in the kcp-go wire format
//!
//! Every datagram starts with a 16 byte random nonce and a little-endian
//! CRC32 (IEEE) of the payload, and the whole datagram is then run through
//! the configured cipher. The header is present for every cipher, `none`
//! included. Block ciphers run in CFB mode from a fixed initial vector; the
//! random nonce in the first block is what varies the keystream.
use std::{fmt, sync::Arc};

use aes::{Aes128, Aes192, Aes256};
use blowfish::Blowfish;
use cast5::Cast5;
use cfb_mode::cipher::{
  generic_array::GenericArray, AsyncStreamCipher, BlockCipher as BlockPrimitive, BlockEncryptMut,
  InnerIvInit, KeyInit,
};
use des::TdesEde3;
use rand::RngCore;
use salsa20::{
  cipher::{KeyIvInit, StreamCipher},
  Salsa20,
};
use sha1::Sha1;
use twofish::Twofish;

use crate::common::{BlockCipher, CipherKind};

pub const NONCE_SIZE: usize = 16;
pub const CRC_SIZE: usize = 4;
pub const CRYPT_HEADER_SIZE: usize = NONCE_SIZE + CRC_SIZE;
/// Largest datagram either end sends
pub const MTU_LIMIT: usize = 1500;

const INITIAL_VECTOR: [u8; 16] = [
  167, 115, 79, 156, 18, 172, 27, 1, 164, 21, 242, 193, 252, 120, 230, 107,
];
const XOR_SALT: &[u8] = b"sH3CIVoF#rWLtJo6";
const XOR_ROUNDS: u32 = 32;
const SALSA20_NONCE_SIZE: usize = 8;
/// TEA is run with 16 rounds (8 cycles) on this wire, not the usual 64
const TEA_ROUNDS: usize = 16;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("A {len} byte key is not valid for cipher {kind}")]
pub struct KeyError {
  pub kind: CipherKind,
  pub len: usize,
}

const TEA_DELTA: u32 = 0x9e37_79b9;

fn key_words(key: &[u8]) -> Option<[u32; 4]> {
  if key.len() != 16 {
    return None;
  }
  let mut words = [0u32; 4];
  for (word, bytes) in words.iter_mut().zip(key.chunks_exact(4)) {
    *word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
  }
  Some(words)
}

fn split_block(block: &[u8]) -> (u32, u32) {
  (
    u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
    u32::from_be_bytes([block[4], block[5], block[6], block[7]]),
  )
}

fn join_block(block: &mut [u8], v0: u32, v1: u32) {
  block[..4].copy_from_slice(&v0.to_be_bytes());
  block[4..8].copy_from_slice(&v1.to_be_bytes());
}

/// Tiny Encryption Algorithm, big-endian words, configurable round count
#[derive(Clone)]
struct Tea {
  key: [u32; 4],
  rounds: usize,
}

impl Tea {
  fn new(key: &[u8], rounds: usize) -> Option<Self> {
    Some(Self {
      key: key_words(key)?,
      rounds,
    })
  }

  fn encrypt_block(&self, block: &mut [u8]) {
    let [k0, k1, k2, k3] = self.key;
    let (mut v0, mut v1) = split_block(block);
    let mut sum = 0u32;
    for _ in 0..self.rounds / 2 {
      sum = sum.wrapping_add(TEA_DELTA);
      v0 = v0.wrapping_add(
        (v1 << 4).wrapping_add(k0) ^ v1.wrapping_add(sum) ^ (v1 >> 5).wrapping_add(k1),
      );
      v1 = v1.wrapping_add(
        (v0 << 4).wrapping_add(k2) ^ v0.wrapping_add(sum) ^ (v0 >> 5).wrapping_add(k3),
      );
    }
    join_block(block, v0, v1);
  }
}

const XTEA_ROUNDS: usize = 64;

/// XTEA with its round keys precomputed
#[derive(Clone)]
struct Xtea {
  table: [u32; XTEA_ROUNDS],
}

impl Xtea {
  fn new(key: &[u8]) -> Option<Self> {
    let key = key_words(key)?;
    let mut table = [0u32; XTEA_ROUNDS];
    let mut sum = 0u32;
    for pair in table.chunks_exact_mut(2) {
      pair[0] = sum.wrapping_add(key[(sum & 3) as usize]);
      sum = sum.wrapping_add(TEA_DELTA);
      pair[1] = sum.wrapping_add(key[((sum >> 11) & 3) as usize]);
    }
    Some(Self { table })
  }

  fn encrypt_block(&self, block: &mut [u8]) {
    let (mut v0, mut v1) = split_block(block);
    for pair in self.table.chunks_exact(2) {
      v0 = v0.wrapping_add((((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)) ^ pair[0]);
      v1 = v1.wrapping_add((((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0)) ^ pair[1]);
    }
    join_block(block, v0, v1);
  }
}

/// CFB over a bare block encryption function, for ciphers without a RustCrypto implementation
fn cfb_encrypt_with(block_len: usize, encrypt: impl Fn(&mut [u8]), buf: &mut [u8]) {
  let mut register = [0u8; 16];
  register[..block_len].copy_from_slice(&INITIAL_VECTOR[..block_len]);
  for chunk in buf.chunks_mut(block_len) {
    encrypt(&mut register[..block_len]);
    for (byte, key) in chunk.iter_mut().zip(register.iter()) {
      *byte ^= key;
    }
    register[..chunk.len()].copy_from_slice(chunk);
  }
}

fn cfb_decrypt_with(block_len: usize, encrypt: impl Fn(&mut [u8]), buf: &mut [u8]) {
  let mut register = [0u8; 16];
  register[..block_len].copy_from_slice(&INITIAL_VECTOR[..block_len]);
  let mut feedback = [0u8; 16];
  for chunk in buf.chunks_mut(block_len) {
    encrypt(&mut register[..block_len]);
    feedback[..chunk.len()].copy_from_slice(chunk);
    for (byte, key) in chunk.iter_mut().zip(register.iter()) {
      *byte ^= key;
    }
    register[..chunk.len()].copy_from_slice(&feedback[..chunk.len()]);
  }
}

fn cfb_encrypt<C>(cipher: &C, buf: &mut [u8])
where
  C: BlockEncryptMut + BlockPrimitive + Clone,
{
  let iv = GenericArray::from_slice(&INITIAL_VECTOR[..C::block_size()]);
  cfb_mode::Encryptor::<C>::inner_iv_init(cipher.clone(), iv).encrypt(buf);
}

fn cfb_decrypt<C>(cipher: &C, buf: &mut [u8])
where
  C: BlockEncryptMut + BlockPrimitive + Clone,
{
  let iv = GenericArray::from_slice(&INITIAL_VECTOR[..C::block_size()]);
  cfb_mode::Decryptor::<C>::inner_iv_init(cipher.clone(), iv).decrypt(buf);
}

#[derive(Clone)]
enum Engine {
  None,
  Xor(Arc<[u8]>),
  Salsa20(salsa20::Key),
  Aes128(Aes128),
  Aes192(Aes192),
  Aes256(Aes256),
  Blowfish(Blowfish),
  Twofish(Twofish),
  Cast5(Cast5),
  TripleDes(TdesEde3),
  Tea(Tea),
  Xtea(Xtea),
}

impl Engine {
  fn new(kind: CipherKind, key: &[u8]) -> Option<Self> {
    Some(match kind {
      CipherKind::None => Engine::None,
      CipherKind::Xor => {
        let mut table = vec![0u8; MTU_LIMIT];
        pbkdf2::pbkdf2_hmac::<Sha1>(key, XOR_SALT, XOR_ROUNDS, &mut table);
        Engine::Xor(table.into())
      }
      CipherKind::Salsa20 => {
        if key.len() != 32 {
          return None;
        }
        Engine::Salsa20(salsa20::Key::from_slice(key).clone())
      }
      CipherKind::Aes128 => Engine::Aes128(Aes128::new_from_slice(key).ok()?),
      CipherKind::Aes192 => Engine::Aes192(Aes192::new_from_slice(key).ok()?),
      CipherKind::Aes => Engine::Aes256(Aes256::new_from_slice(key).ok()?),
      CipherKind::Blowfish => Engine::Blowfish(Blowfish::new_from_slice(key).ok()?),
      CipherKind::Twofish => Engine::Twofish(Twofish::new_from_slice(key).ok()?),
      CipherKind::Cast5 => Engine::Cast5(Cast5::new_from_slice(key).ok()?),
      CipherKind::TripleDes => Engine::TripleDes(TdesEde3::new_from_slice(key).ok()?),
      CipherKind::Tea => Engine::Tea(Tea::new(key, TEA_ROUNDS)?),
      CipherKind::Xtea => Engine::Xtea(Xtea::new(key)?),
    })
  }

  fn encrypt(&self, buf: &mut [u8]) {
    match self {
      Engine::None => {}
      Engine::Xor(table) => xor_with(table, buf),
      Engine::Salsa20(key) => salsa20_with(key, buf),
      Engine::Aes128(c) => cfb_encrypt(c, buf),
      Engine::Aes192(c) => cfb_encrypt(c, buf),
      Engine::Aes256(c) => cfb_encrypt(c, buf),
      Engine::Blowfish(c) => cfb_encrypt(c, buf),
      Engine::Twofish(c) => cfb_encrypt(c, buf),
      Engine::Cast5(c) => cfb_encrypt(c, buf),
      Engine::TripleDes(c) => cfb_encrypt(c, buf),
      Engine::Tea(c) => cfb_encrypt_with(8, |b| c.encrypt_block(b), buf),
      Engine::Xtea(c) => cfb_encrypt_with(8, |b| c.encrypt_block(b), buf),
    }
  }

  fn decrypt(&self, buf: &mut [u8]) {
    match self {
      Engine::None => {}
      Engine::Xor(table) => xor_with(table, buf),
      Engine::Salsa20(key) => salsa20_with(key, buf),
      Engine::Aes128(c) => cfb_decrypt(c, buf),
      Engine::Aes192(c) => cfb_decrypt(c, buf),
      Engine::Aes256(c) => cfb_decrypt(c, buf),
      Engine::Blowfish(c) => cfb_decrypt(c, buf),
      Engine::Twofish(c) => cfb_decrypt(c, buf),
      Engine::Cast5(c) => cfb_decrypt(c, buf),
      Engine::TripleDes(c) => cfb_decrypt(c, buf),
      Engine::Tea(c) => cfb_decrypt_with(8, |b| c.encrypt_block(b), buf),
      Engine::Xtea(c) => cfb_decrypt_with(8, |b| c.encrypt_block(b), buf),
    }
  }
}

fn xor_with(table: &[u8], buf: &mut [u8]) {
  for (byte, key) in buf.iter_mut().zip(table.iter()) {
    *byte ^= key;
  }
}

/// The first eight bytes stay in the clear and seed the keystream
fn salsa20_with(key: &salsa20::Key, buf: &mut [u8]) {
  if buf.len() <= SALSA20_NONCE_SIZE {
    return;
  }
  let (nonce, body) = buf.split_at_mut(SALSA20_NONCE_SIZE);
  Salsa20::new(key, salsa20::Nonce::from_slice(nonce)).apply_keystream(body);
}

/// Seals outgoing and opens incoming datagrams for one cipher and key
#[derive(Clone)]
pub struct PacketCrypt {
  kind: CipherKind,
  engine: Engine,
}

impl fmt::Debug for PacketCrypt {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PacketCrypt")
      .field("kind", &self.kind)
      .finish_non_exhaustive()
  }
}

impl PacketCrypt {
  pub fn new(cipher: &BlockCipher) -> Result<Self, KeyError> {
    let engine = Engine::new(cipher.kind(), cipher.key()).ok_or(KeyError {
      kind: cipher.kind(),
      len: cipher.key().len(),
    })?;
    Ok(Self {
      kind: cipher.kind(),
      engine,
    })
  }

  pub fn kind(&self) -> CipherKind {
    self.kind
  }

  /// Fills the header of `packet` and encrypts it in place.
  ///
  /// The first [`CRYPT_HEADER_SIZE`] bytes are reserved for the header; the
  /// payload follows.
  pub fn seal(&self, packet: &mut [u8]) {
    if packet.len() < CRYPT_HEADER_SIZE {
      return;
    }
    rand::thread_rng().fill_bytes(&mut packet[..NONCE_SIZE]);
    let checksum = crc32fast::hash(&packet[CRYPT_HEADER_SIZE..]);
    packet[NONCE_SIZE..CRYPT_HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
    self.engine.encrypt(packet);
  }

  /// Decrypts `packet` in place, returning its payload when the checksum holds
  pub fn open<'a>(&self, packet: &'a mut [u8]) -> Option<&'a [u8]> {
    if packet.len() <= CRYPT_HEADER_SIZE {
      return None;
    }
    self.engine.decrypt(packet);
    let expected = u32::from_le_bytes([
      packet[NONCE_SIZE],
      packet[NONCE_SIZE + 1],
      packet[NONCE_SIZE + 2],
      packet[NONCE_SIZE + 3],
    ]);
    let payload = &packet[CRYPT_HEADER_SIZE..];
    (crc32fast::hash(payload) == expected).then_some(payload)
  }
}
