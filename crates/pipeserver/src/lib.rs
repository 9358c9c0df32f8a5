// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ephemeral key-addressed streaming relay over HTTP.
//!
//! Senders push byte streams into a named pipe; receivers tail that pipe as a
//! chunked response. Nothing is buffered or stored: bytes are fanned out to
//! whichever receivers are attached to the pipe's key at that moment and are
//! otherwise dropped.

pub mod collection;
pub mod message;
mod opts;
pub mod pipe;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod templates;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use opts::Opts;
