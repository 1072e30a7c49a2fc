// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod protect;
pub mod relay;
pub mod tunnel_stream;
pub mod validators;

pub use self::relay::{relay, Direction, RelayOutcome};
