// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The write-side half of one request attached to a pipe

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use tracing::debug;

use crate::message::display_name;
use crate::pipe::Pipe;

/// A sender streams one request body into its pipe. It shares the request's
/// id with the receiver half of the same request, which is what keeps a
/// chatting peer from hearing its own bytes back.
pub struct Sender {
    pipe: Arc<Pipe>,
    id: u64,
    username: Option<String>,
}

impl Sender {
    pub fn new(pipe: Arc<Pipe>, id: u64, username: Option<String>) -> Self {
        Self { pipe, id, username }
    }

    pub fn username(&self) -> String {
        display_name(self.username.as_deref(), self.id)
    }

    /// Fan one buffer out through the pipe.
    pub async fn write(&self, buffer: Bytes) -> usize {
        self.pipe
            .write(buffer, self.id, false, self.username())
            .await
    }

    /// Close every receiver on the pipe.
    pub async fn close(&self) {
        self.pipe.close().await
    }

    /// Stream `body` into the pipe, one frame at a time.
    ///
    /// Receivers are closed only on a clean EOF. A read error (client gone,
    /// upload cap exceeded) abandons the copy but leaves the pipe open, so
    /// attached receivers keep listening and other senders keep going.
    /// Returns the number of payload bytes moved.
    pub async fn copy<B>(&self, mut body: B) -> u64
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let mut copied: u64 = 0;
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        copied += data.len() as u64;
                        self.write(data).await;
                    }
                }
                Some(Err(err)) => {
                    debug!("sender {}: upload ended early: {err}", self.id);
                    return copied;
                }
                None => break,
            }
        }
        self.close().await;
        copied
    }
}
