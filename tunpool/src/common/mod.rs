// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod cipher;
pub mod config;
pub mod protocol;

pub use cipher::{BlockCipher, CipherKind};
pub use config::{NoDelay, PoolPolicy, Profile, TransportConfig};
