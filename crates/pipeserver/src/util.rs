// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Small shared utilities

use rand::rngs::OsRng;
use rand::Rng;

const KEY_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate `n` characters drawn uniformly from `[a-zA-Z0-9]`.
///
/// Keys are sampled from the OS RNG so that concurrently generated keys
/// cannot collide by seeding.
pub fn rand_key(n: usize) -> String {
    (0..n)
        .map(|_| KEY_CHARS[OsRng.gen_range(0..KEY_CHARS.len())] as char)
        .collect()
}
