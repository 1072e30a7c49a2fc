// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Pooled, multiplexed tunnel sessions behind a local TCP front end.
//!
//! Local connections are accepted by the [`client::Dispatcher`], assigned to a
//! [`pool::SessionPool`] slot by round robin, and bridged to a stream opened on
//! that slot's mux session by [`util::relay`].
#![warn(unused_imports)]

#[cfg(not(unix))]
compile_error!("tunpool relies on unix socket facilities (SCM_RIGHTS, raw descriptors)");

pub mod common;
pub mod util;

pub mod client;
pub mod pool;
