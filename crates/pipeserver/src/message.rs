// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-recipient message shaping for the interactive chat layer

use bytes::{BufMut, Bytes, BytesMut};

use crate::receiver::ReceiveWriter;

/// The name a peer is shown as: the supplied username, or `client <id>` if
/// none was supplied.
pub fn display_name(username: Option<&str>, id: u64) -> String {
    match username {
        Some(name) if !name.is_empty() => name.to_owned(),
        _ => format!("client {id}"),
    }
}

/// A single fan-out event.
///
/// System messages are broker-generated (connected/disconnected) and bypass
/// byte accounting; non-system messages carry sender bytes.
#[derive(Clone, Debug)]
pub struct Message {
    pub from_id: u64,
    pub from_user: String,
    pub buffer: Bytes,
    pub system: bool,
}

impl Message {
    /// Broker notification that `peer` attached to the pipe.
    pub fn connected(peer: &dyn ReceiveWriter) -> Self {
        Self {
            from_id: peer.id(),
            from_user: peer.username(),
            buffer: Bytes::from_static(b"connected\n"),
            system: true,
        }
    }

    /// Broker notification that `peer` detached from the pipe.
    pub fn disconnected(peer: &dyn ReceiveWriter) -> Self {
        Self {
            from_id: peer.id(),
            from_user: peer.username(),
            buffer: Bytes::from_static(b"disconnected\n"),
            system: true,
        }
    }

    /// Render this message for one recipient, or `None` if the recipient
    /// should not be written to at all.
    pub fn format(&self, recipient: &dyn ReceiveWriter) -> Option<Bytes> {
        if recipient.interactive() {
            self.format_interactive(recipient)
        } else {
            self.format_plain(recipient)
        }
    }

    /// Interactive peers get a username prefix and see system messages,
    /// including their own; their own data is not echoed back.
    fn format_interactive(&self, recipient: &dyn ReceiveWriter) -> Option<Bytes> {
        if self.from_id == recipient.id() && !self.system {
            return None;
        }
        let mut out = BytesMut::with_capacity(self.from_user.len() + 2 + self.buffer.len());
        out.put_slice(self.from_user.as_bytes());
        out.put_slice(b": ");
        out.put_slice(&self.buffer);
        Some(out.freeze())
    }

    /// Plain peers get raw bytes only: no system messages, no self-echo.
    fn format_plain(&self, recipient: &dyn ReceiveWriter) -> Option<Bytes> {
        if self.system || self.from_id == recipient.id() {
            return None;
        }
        Some(self.buffer.clone())
    }
}
