// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Seams to the protocol layers a session is built from
//!
//! Building a session, bottom-up:
//!
//! - dial a [`transport::Transport`] connection (KCP over UDP)
//! - optionally wrap it in [`compress::CompStream`]
//! - negotiate a client-side [`mux::MuxSession`] over it
//! - open one mux stream per local connection
//!
//! None of the layers are implemented here; each module holds a trait and a
//! thin adapter over an existing crate.

pub mod compress;
pub mod mux;
pub mod transport;

pub use mux::{BoxedSession, MuxConnector, MuxError, MuxSession};
pub use transport::{SocketPreparer, Transport};
