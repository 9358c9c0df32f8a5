// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The read-side half of one request attached to a pipe

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::message::display_name;

/// What a pipe knows about an attached receiver.
///
/// The pipe fans out through this seam so tests can attach in-memory
/// receivers without a connection behind them.
#[async_trait]
pub trait ReceiveWriter: Send + Sync {
    /// Identifier of the request this receiver belongs to.
    fn id(&self) -> u64;

    /// Whether to show this peer connect/disconnect messages and username prefixes.
    fn interactive(&self) -> bool;

    /// The username supplied by the client, or `client <id>` if none was.
    fn username(&self) -> String;

    /// Deliver one buffer. Empty buffers are skipped without touching the sink.
    async fn write(&self, buffer: Bytes) -> anyhow::Result<usize>;

    /// Tell the receiver its pipe saw a sender EOF. Called at most once.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Resolves exactly once, when the pipe closes its receiver after a sender EOF.
/// Never resolves on client disconnect.
pub type CloseNotify = oneshot::Receiver<()>;

/// A receiver backed by a live HTTP response.
///
/// The sink is the bounded channel feeding the response's streamed body: each
/// buffer becomes its own body frame, so a buffer is on the wire as soon as
/// the connection can take it, and a slow client exerts backpressure on
/// whoever is writing to the pipe.
pub struct Receiver {
    id: u64,
    interactive: bool,
    username: Option<String>,
    sink: mpsc::Sender<Bytes>,
    closed: Mutex<Option<oneshot::Sender<()>>>,
}

impl Receiver {
    pub fn new(
        id: u64,
        interactive: bool,
        username: Option<String>,
        sink: mpsc::Sender<Bytes>,
    ) -> (Arc<Self>, CloseNotify) {
        let (closed_tx, closed_rx) = oneshot::channel();
        let receiver = Arc::new(Self {
            id,
            interactive,
            username,
            sink,
            closed: Mutex::new(Some(closed_tx)),
        });
        (receiver, closed_rx)
    }

    /// Resolves when the response body fed by the sink has been dropped,
    /// i.e. the client went away.
    pub async fn disconnected(&self) {
        self.sink.closed().await
    }
}

#[async_trait]
impl ReceiveWriter for Receiver {
    fn id(&self) -> u64 {
        self.id
    }

    fn interactive(&self) -> bool {
        self.interactive
    }

    fn username(&self) -> String {
        display_name(self.username.as_deref(), self.id)
    }

    async fn write(&self, buffer: Bytes) -> anyhow::Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }
        let n = buffer.len();
        self.sink
            .send(buffer)
            .await
            .map_err(|_| anyhow::anyhow!("receiver {} is gone", self.id))?;
        Ok(n)
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Frames flush as they are sent, so all that's left is the notification.
        let notify = self.closed.lock().unwrap().take();
        if let Some(notify) = notify {
            // The hold task consuming the notification may already have seen
            // the client disconnect; that's its call, not an error here.
            let _ = notify.send(());
        }
        Ok(())
    }
}
