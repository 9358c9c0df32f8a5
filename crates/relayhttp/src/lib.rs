// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal tools for serving the pipe relay over HTTP

pub mod nursery;
pub mod response;
pub mod server;
pub mod signal;

pub use server::Server;
